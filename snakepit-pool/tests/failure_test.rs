//! Eviction, replacement, circuit breaking and start-up failures

mod common;

use common::*;
use serde_json::json;
use snakepit_pool::{
    CheckinOutcome, EvictionEvent, EvictionReason, Pool, PoolError, ProbeEvent, Telemetry,
    WorkerState,
};
use snakepit_resilience::{CircuitScope, CircuitState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_unhealthy_worker_is_replaced() {
    let pool = start(echo_config(1)).await;

    let handle = pool.checkout(None, None).await.unwrap();
    let evicted = handle.worker_id().clone();
    pool.checkin(handle, CheckinOutcome::Unhealthy);

    // Removed at checkin, before the process is gone
    assert!(pool.stats().worker(&evicted).is_none());

    for _ in 0..3 {
        let handle = pool.checkout(None, None).await.unwrap();
        assert_ne!(handle.worker_id(), &evicted);
        assert_eq!(handle.slot(), 0);
        pool.checkin(handle, CheckinOutcome::Healthy);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_exchange_poisons_and_evicts() {
    let mut config = echo_config(1);
    config.pool.startup_timeout = Duration::from_secs(3);
    let pool = start(config).await;

    let mut handle = pool.checkout(None, None).await.unwrap();
    let stuck = handle.worker_id().clone();
    let err = handle
        .call("sleep", json!({"ms": 5000}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::OperationTimeout { .. }));
    assert!(handle.is_poisoned());

    // Declared healthy, evicted anyway
    pool.checkin(handle, CheckinOutcome::Healthy);

    let reply = pool.execute("echo", json!({})).await.unwrap();
    assert_ne!(worker_of(&reply), stuck.as_str());

    pool.shutdown().await;
}

#[tokio::test]
async fn test_crash_during_request_is_reported() {
    let pool = start(echo_config(1)).await;
    let crashed = ready_ids(&pool)[0].clone();

    let err = pool.execute("crash", json!({})).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrash { .. }), "{}", err);

    let reply = pool.execute("echo", json!({})).await.unwrap();
    assert_ne!(worker_of(&reply), crashed.as_str());

    pool.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_idle_worker_death_is_detected() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pool = start(echo_config(1)).await;
    let victim = pool.stats().workers[0].clone();
    kill(Pid::from_raw(victim.pid.unwrap() as i32), Signal::SIGKILL).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            let ready = ready_ids(&pool);
            ready.len() == 1 && ready[0] != victim.id
        })
        .await
    );
    assert_eq!(pool.stats().workers[0].slot, victim.slot);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_open_circuit_fails_fast_and_admits_one_trial() {
    let mut config = echo_config(1);
    config.circuit_breaker.enabled = true;
    config.circuit_breaker.pool_scope = true;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown = Duration::from_millis(300);
    let pool = start(config).await;

    for _ in 0..2 {
        let handle = pool.checkout(None, None).await.unwrap();
        pool.checkin(handle, CheckinOutcome::Unhealthy);
    }

    let err = pool.checkout(None, None).await.unwrap_err();
    match err {
        PoolError::CircuitOpen { scope, retry_after } => {
            assert_eq!(scope, CircuitScope::Pool);
            assert!(retry_after.is_some());
        }
        other => panic!("unexpected error: {}", other),
    }

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(wait_until(Duration::from_secs(5), || ready_ids(&pool).len() == 1).await);

    let trial = pool.checkout(None, None).await.unwrap();
    let second = pool
        .checkout(None, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(second, PoolError::CircuitOpen { .. }), "{}", second);

    pool.checkin(trial, CheckinOutcome::Healthy);
    let handle = pool.checkout(None, None).await.unwrap();
    pool.checkin(handle, CheckinOutcome::Healthy);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_early_checkin_does_not_close_half_open_circuit() {
    let mut config = echo_config(3);
    config.circuit_breaker.enabled = true;
    config.circuit_breaker.pool_scope = true;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown = Duration::from_millis(300);
    let pool = start(config).await;

    // Granted while the circuit was still closed
    let early = pool.checkout(None, None).await.unwrap();
    for _ in 0..2 {
        let handle = pool.checkout(None, None).await.unwrap();
        pool.checkin(handle, CheckinOutcome::Unhealthy);
    }
    assert_eq!(pool.stats().pool_circuit, Some(CircuitState::Open));

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(wait_until(Duration::from_secs(5), || ready_ids(&pool).len() == 2).await);

    let trial = pool.checkout(None, None).await.unwrap();
    assert_eq!(pool.stats().pool_circuit, Some(CircuitState::HalfOpen));

    pool.checkin(early, CheckinOutcome::Healthy);
    assert_eq!(pool.stats().pool_circuit, Some(CircuitState::HalfOpen));
    let err = pool
        .checkout(None, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }), "{}", err);

    pool.checkin(trial, CheckinOutcome::Healthy);
    assert_eq!(pool.stats().pool_circuit, Some(CircuitState::Closed));
    let handle = pool.checkout(None, None).await.unwrap();
    pool.checkin(handle, CheckinOutcome::Healthy);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_open_slot_circuit_blocks_its_worker() {
    let mut config = echo_config(1);
    config.circuit_breaker.enabled = true;
    config.circuit_breaker.pool_scope = false;
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.cooldown = Duration::from_secs(30);
    let pool = start(config).await;

    let handle = pool.checkout(None, None).await.unwrap();
    pool.checkin(handle, CheckinOutcome::Unhealthy);
    assert!(wait_until(Duration::from_secs(5), || ready_ids(&pool).len() == 1).await);

    let err = pool.checkout(None, None).await.unwrap_err();
    match err {
        PoolError::CircuitOpen { scope, .. } => assert_eq!(scope, CircuitScope::Slot(0)),
        other => panic!("unexpected error: {}", other),
    }
    assert!(pool.stats().pool_circuit.is_none());

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failing_handshake_fails_start() {
    let mut config = with_worker_args(echo_config(1), &["--fail-handshake"]);
    config.pool.max_start_attempts = 2;
    snakepit_logging::init_test_tracing();

    match Pool::from_config(config).await {
        Err(PoolError::StartFailed {
            ready,
            required,
            attempts,
        }) => {
            assert_eq!(ready, 0);
            assert_eq!(required, 1);
            assert_eq!(attempts, 2);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("pool started with a failing handshake"),
    }
}

/// Launch workers through `sh -c script`; the script sees the echo worker
/// binary as `$SNAKEPIT_TEST_ECHO` and the worker id as `$4`
#[cfg(unix)]
fn through_shell(
    mut config: snakepit_config::SnakepitConfig,
    script: &str,
) -> snakepit_config::SnakepitConfig {
    let echo = std::mem::replace(&mut config.worker.command, "/bin/sh".to_string());
    config.worker.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    config.worker.env.insert("SNAKEPIT_TEST_ECHO".to_string(), echo);
    config
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_failure_reports_attempts_made() {
    let dir = tempfile::tempdir().unwrap();
    let launches = dir.path().join("launches");
    let mut config = through_shell(
        echo_config(1),
        r#"echo "$4" >> "$SNAKEPIT_TEST_LAUNCHES"; exec "$SNAKEPIT_TEST_ECHO" "$@" --fail-handshake"#,
    );
    config.worker.env.insert(
        "SNAKEPIT_TEST_LAUNCHES".to_string(),
        launches.display().to_string(),
    );
    config.pool.max_start_attempts = 3;
    snakepit_logging::init_test_tracing();

    let err = Pool::from_config(config).await.err().unwrap();
    let launched = std::fs::read_to_string(&launches).unwrap().lines().count();
    assert_eq!(launched, 3);
    match err {
        PoolError::StartFailed { ready, attempts, .. } => {
            assert_eq!(ready, 0);
            assert_eq!(attempts as usize, launched);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_before_admission_is_not_admitted() {
    // The first slot 0 worker dies right after its handshake, while slot 1
    // is still handshaking and holding up admission
    let dir = tempfile::tempdir().unwrap();
    let mut config = through_shell(
        echo_config(2),
        r#"case "$4" in
  worker-0-*)
    if mkdir "$SNAKEPIT_TEST_MARKER" 2>/dev/null; then
      exec "$SNAKEPIT_TEST_ECHO" "$@" --exit-after-handshake-ms 100
    fi ;;
  *) exec "$SNAKEPIT_TEST_ECHO" "$@" --handshake-delay-ms 1500 ;;
esac
exec "$SNAKEPIT_TEST_ECHO" "$@""#,
    );
    config.worker.env.insert(
        "SNAKEPIT_TEST_MARKER".to_string(),
        dir.path().join("slot-0-started").display().to_string(),
    );
    config.pool.min_ready = 1;
    snakepit_logging::init_test_tracing();

    let recorder = Arc::new(Recorder::default());
    let pool = Pool::builder(snakepit_config::ConfigHandle::new(config).unwrap())
        .telemetry(recorder.clone())
        .start()
        .await
        .unwrap();

    let dead = recorder
        .evictions
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.slot == 0 && matches!(e.reason, EvictionReason::ProcessExited(_)))
        .map(|e| e.worker_id.clone())
        .expect("slot 0 exit was not noticed at admission");
    assert!(pool.stats().worker(&dead).is_none());

    assert!(wait_until(Duration::from_secs(5), || ready_ids(&pool).len() == 2).await);
    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(pool.checkout(None, None).await.unwrap());
    }
    for handle in &mut handles {
        assert_ne!(handle.worker_id(), &dead);
        let reply = handle
            .call("echo", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(worker_of(&reply), handle.worker_id().as_str());
    }
    for handle in handles {
        pool.checkin(handle, CheckinOutcome::Healthy);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_slow_handshake_times_out() {
    let mut config = with_worker_args(echo_config(1), &["--handshake-delay-ms", "3000"]);
    config.worker.handshake_timeout = Duration::from_millis(200);
    config.pool.max_start_attempts = 1;
    snakepit_logging::init_test_tracing();

    let err = Pool::from_config(config).await.err().unwrap();
    assert!(matches!(err, PoolError::StartFailed { ready: 0, .. }), "{}", err);
}

#[tokio::test]
async fn test_unready_workers_are_never_handed_out() {
    let mut config = with_worker_args(echo_config(1), &["--fail-handshake"]);
    config.pool.min_ready = 0;
    config.pool.max_start_attempts = 1;
    let pool = start(config).await;

    assert_eq!(pool.stats().live(), 0);
    let err = pool
        .checkout(None, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::CheckoutTimeout { .. }), "{}", err);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_replacement_escalates() {
    let mut config = echo_config(1);
    config.pool.max_start_attempts = 1;
    let pool = start(config).await;
    let mut escalations = pool.subscribe_escalations();

    // Replacements from now on cannot finish their handshake
    pool.config()
        .update(|c| c.worker.args = vec!["--fail-handshake".to_string()])
        .unwrap();
    let handle = pool.checkout(None, None).await.unwrap();
    pool.checkin(handle, CheckinOutcome::Unhealthy);

    let escalation = tokio::time::timeout(Duration::from_secs(5), escalations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(escalation.slot, 0);
    assert_eq!(escalation.live_workers, 0);
    assert_eq!(escalation.min_ready, 1);
    assert!(escalation.last_error.contains("handshake"));

    pool.shutdown().await;
}

#[derive(Default)]
struct Recorder {
    probes: Mutex<Vec<ProbeEvent>>,
    evictions: Mutex<Vec<EvictionEvent>>,
}

impl Telemetry for Recorder {
    fn on_eviction(&self, event: &EvictionEvent) {
        self.evictions.lock().unwrap().push(event.clone());
    }

    fn on_health_probe(&self, event: &ProbeEvent) {
        self.probes.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn test_unanswered_probe_evicts_idle_worker() {
    let mut config = with_worker_args(echo_config(1), &["--hang-pings-after", "1"]);
    config.health.enabled = true;
    config.health.interval = Duration::from_millis(100);
    config.health.idle_threshold = Duration::from_millis(50);
    config.health.probe_timeout = Duration::from_millis(100);
    config.health.max_probe_failures = 1;
    snakepit_logging::init_test_tracing();

    let recorder = Arc::new(Recorder::default());
    let pool = Pool::builder(snakepit_config::ConfigHandle::new(config).unwrap())
        .telemetry(recorder.clone())
        .start()
        .await
        .unwrap();
    let first = ready_ids(&pool)[0].clone();

    assert!(
        wait_until(Duration::from_secs(5), || {
            recorder
                .evictions
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.worker_id == first && e.reason == EvictionReason::ProbeFailed)
        })
        .await
    );
    let probe = recorder.probes.lock().unwrap()[0].clone();
    assert_eq!(probe.worker_id, first);
    assert!(!probe.healthy);
    assert_eq!(probe.consecutive_failures, 1);

    assert!(
        wait_until(Duration::from_secs(5), || {
            pool.stats()
                .workers
                .iter()
                .any(|w| w.id != first && w.state == WorkerState::Ready)
        })
        .await
    );

    pool.shutdown().await;
}
