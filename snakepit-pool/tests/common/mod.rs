//! Shared helpers for pool integration tests
//!
//! Pools launch the `snakepit-echo-worker` binary built alongside the tests.

#![allow(dead_code)]

use serde_json::Value as JsonValue;
use snakepit_config::SnakepitConfig;
use snakepit_pool::{Pool, WorkerId, WorkerState};
use std::time::{Duration, Instant};

/// A small, fast pool of echo workers with breakers and probes off
pub fn echo_config(size: usize) -> SnakepitConfig {
    let mut config = SnakepitConfig::default();
    config.worker.command = env!("CARGO_BIN_EXE_snakepit-echo-worker").to_string();
    config.worker.args = Vec::new();
    config.worker.handshake_timeout = Duration::from_secs(5);
    config.worker.shutdown_timeout = Duration::from_millis(500);

    config.pool.size = size;
    config.pool.min_ready = size;
    config.pool.max_overflow = 0;
    config.pool.checkout_timeout = Duration::from_secs(5);
    config.pool.operation_timeout = Duration::from_secs(5);
    config.pool.startup_timeout = Duration::from_secs(10);
    config.pool.start_retry_delay = Duration::from_millis(20);

    config.circuit_breaker.enabled = false;
    config.health.enabled = false;
    config
}

pub fn with_worker_args(mut config: SnakepitConfig, args: &[&str]) -> SnakepitConfig {
    config.worker.args = args.iter().map(|a| a.to_string()).collect();
    config
}

pub async fn start(config: SnakepitConfig) -> Pool {
    snakepit_logging::init_test_tracing();
    Pool::from_config(config).await.unwrap()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn worker_of(reply: &JsonValue) -> String {
    reply["worker_id"].as_str().unwrap().to_string()
}

pub fn ready_ids(pool: &Pool) -> Vec<WorkerId> {
    pool.stats()
        .workers
        .into_iter()
        .filter(|w| w.state == WorkerState::Ready)
        .map(|w| w.id)
        .collect()
}
