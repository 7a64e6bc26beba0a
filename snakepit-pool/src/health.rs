//! Periodic health monitor
//!
//! Each round probes idle workers with a nonce `ping`, fills base slots that
//! are neither occupied nor starting, and hands freed workers to waiters.

use futures::future::join_all;
use snakepit_resilience::ShutdownSignal;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::coordinator::PoolInner;
use crate::handle::WorkerHandle;

pub(crate) async fn run(pool: Weak<PoolInner>, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
    loop {
        let Some(interval) = pool
            .upgrade()
            .map(|inner| inner.config.read(|c| c.health.interval))
        else {
            break;
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => break,
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        round(&inner).await;
    }
    debug!("Health monitor stopped");
}

async fn round(inner: &Arc<PoolInner>) {
    let (enabled, idle_threshold, probe_timeout) = inner.config.read(|c| {
        (
            c.health.enabled,
            c.health.idle_threshold,
            c.health.probe_timeout,
        )
    });

    inner.replenish();
    if !enabled {
        return;
    }

    let due = inner.lease_for_probe(idle_threshold);
    if due.is_empty() {
        return;
    }
    debug!(workers = due.len(), "Probing idle workers");

    join_all(due.into_iter().map(|handle| probe(inner, handle, probe_timeout))).await;
}

async fn probe(inner: &Arc<PoolInner>, mut handle: WorkerHandle, deadline: Duration) {
    let started = Instant::now();
    let result = handle.probe(deadline).await.map(|_| ());
    inner.finish_probe(handle, result, started.elapsed());
}
