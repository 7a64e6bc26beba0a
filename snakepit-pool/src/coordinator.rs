//! Pool coordinator
//!
//! All registry, affinity, circuit and wait-queue decisions are made under a
//! single lock that is never held across an `.await`. Worker I/O happens in
//! the caller's task through the [`WorkerHandle`] it was given, so the
//! serialized section is constant-time bookkeeping per checkout and checkin.
//!
//! Process exits and dropped handles arrive through an event channel drained
//! by a background task; worker starts and terminations run as spawned tasks
//! that report back through the same locked section.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use snakepit_config::{CircuitBreakerSettings, ConfigHandle, SnakepitConfig};
use snakepit_ipc::{CleanupSession, CleanupSessionArgs};
use snakepit_resilience::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, CircuitScope, RetryError,
    RetryExecutor, RetryPolicy, ShutdownCoordinator, ShutdownSignal, TransitionListener,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::affinity::{AffinityLookup, AffinityTracker};
use crate::channel::WorkerChannel;
use crate::error::{InitializationFailure, PoolError, PoolResult};
use crate::handle::{CheckinOutcome, Lease, LeaseKind, PoolEvent, WorkerHandle};
use crate::health;
use crate::stats::{PoolStats, WorkerSnapshot};
use crate::telemetry::{
    CheckinEvent, CheckoutEvent, EvictionEvent, EvictionReason, ProbeEvent, Telemetry,
    TracingTelemetry,
};
use crate::worker::{
    spawn_worker, terminate_worker, transition, ProcessMonitor, SpawnedWorker, WorkerId,
    WorkerState,
};

/// Raised when live workers drop below `min_ready` and a start gave up
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub slot: usize,
    pub attempts: u32,
    pub live_workers: usize,
    pub min_ready: usize,
    pub last_error: String,
    pub at: DateTime<Utc>,
}

/// A slot whose start attempts all failed
struct StartFailure {
    attempts: u32,
    error: InitializationFailure,
}

impl StartFailure {
    fn new(slot: usize, e: RetryError<InitializationFailure>) -> Self {
        let attempts = e.attempts();
        let error = match e {
            RetryError::BudgetExhausted {
                budget,
                last_error: None,
                ..
            } => InitializationFailure::StartupBudgetExceeded { slot, budget },
            other => match other.into_last_error() {
                Some(error) => error,
                None => InitializationFailure::Cancelled { slot },
            },
        };
        Self { attempts, error }
    }
}

struct WorkerRecord {
    id: WorkerId,
    slot: usize,
    overflow: bool,
    state: WorkerState,
    /// `None` while checked out
    channel: Option<WorkerChannel>,
    lease: Option<Uuid>,
    monitor: ProcessMonitor,
    bound_session: Option<String>,
    requests_served: u64,
    consecutive_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    idle_since: Instant,
    started_at: DateTime<Utc>,
}

impl WorkerRecord {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            slot: self.slot,
            state: self.state,
            overflow: self.overflow,
            pid: self.monitor.pid(),
            bound_session: self.bound_session.clone(),
            requests_served: self.requests_served,
            consecutive_failures: self.consecutive_failures,
            last_health_check: self.last_health_check,
            started_at: self.started_at,
        }
    }
}

struct Waiter {
    id: u64,
    session_id: Option<String>,
    enqueued_at: Instant,
    tx: oneshot::Sender<PoolResult<WorkerHandle>>,
}

struct PoolState {
    workers: HashMap<WorkerId, WorkerRecord>,
    affinity: AffinityTracker,
    waiters: VecDeque<Waiter>,
    /// Slots with a start in progress
    starting: HashSet<usize>,
    next_waiter_id: u64,
    shutting_down: bool,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.workers.values().filter(|r| r.state.is_live()).count()
    }

    fn slot_taken(&self, slot: usize) -> bool {
        self.starting.contains(&slot) || self.workers.values().any(|r| r.slot == slot)
    }
}

enum Assignment {
    Granted(WorkerHandle),
    Unavailable,
    Rejected(PoolError),
}

pub(crate) struct PoolInner {
    pub(crate) config: ConfigHandle,
    state: Mutex<PoolState>,
    circuits: CircuitRegistry,
    telemetry: Arc<dyn Telemetry>,
    events: mpsc::UnboundedSender<PoolEvent>,
    escalations: broadcast::Sender<Escalation>,
    pub(crate) shutdown: ShutdownCoordinator,
    /// Health monitor and affinity sweeper
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Worker starts and terminations
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

fn breaker_config(settings: &CircuitBreakerSettings) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: settings.failure_threshold,
        window: settings.window,
        cooldown: settings.cooldown,
    }
}

/// Builder for [`Pool`]
pub struct PoolBuilder {
    config: ConfigHandle,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl PoolBuilder {
    /// Replace the default [`TracingTelemetry`]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Start every configured worker and the background tasks
    ///
    /// Fails with [`PoolError::StartFailed`] when fewer than `min_ready`
    /// workers complete their handshake within `max_start_attempts` each.
    /// Slots that failed are retried in the background.
    pub async fn start(self) -> PoolResult<Pool> {
        let config = self.config;
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry));

        let listener_telemetry = telemetry.clone();
        let listener: TransitionListener = Arc::new(move |scope, transition| {
            listener_telemetry.on_circuit_transition(scope, transition)
        });
        let circuits = CircuitRegistry::with_listener(
            config.read(|c| breaker_config(&c.circuit_breaker)),
            listener,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (escalations, _) = broadcast::channel(64);

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                affinity: AffinityTracker::new(config.clone()),
                waiters: VecDeque::new(),
                starting: HashSet::new(),
                next_waiter_id: 0,
                shutting_down: false,
            }),
            config,
            circuits,
            telemetry,
            events: events_tx,
            escalations,
            shutdown: ShutdownCoordinator::new(),
            background: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
        });
        tokio::spawn(event_loop(Arc::downgrade(&inner), events_rx));

        let (size, min_ready) = inner.config.read(|c| (c.pool.size, c.pool.min_ready));
        info!(size, min_ready, "Starting worker pool");

        inner.state.lock().starting.extend(0..size);
        let results = join_all((0..size).map(|slot| inner.start_worker(slot, None))).await;

        let mut failed = Vec::new();
        let mut attempts = 1;
        {
            let mut state = inner.state.lock();
            for (slot, result) in results.into_iter().enumerate() {
                state.starting.remove(&slot);
                match result {
                    Ok(worker) => inner.admit(&mut state, worker, false),
                    Err(e) => {
                        error!(slot, "Worker failed to start after {} attempts: {}", e.attempts, e.error);
                        attempts = attempts.max(e.attempts);
                        failed.push(slot);
                    }
                }
            }
        }

        let pool = Pool { inner };
        let ready = pool.inner.state.lock().live_count();
        if ready < min_ready {
            error!(ready, min_ready, "Pool could not reach its minimum size");
            pool.shutdown().await;
            return Err(PoolError::StartFailed {
                ready,
                required: min_ready,
                attempts,
            });
        }

        {
            let mut state = pool.inner.state.lock();
            for slot in failed {
                pool.inner.spawn_replacement(&mut state, slot);
            }
        }

        let weak = Arc::downgrade(&pool.inner);
        let health_task = tokio::spawn(health::run(weak.clone(), pool.inner.shutdown.subscribe()));
        let sweep_task = tokio::spawn(sweep_loop(weak, pool.inner.shutdown.subscribe()));
        pool.inner.background.lock().extend([health_task, sweep_task]);

        info!(ready, size, "Worker pool started");
        Ok(pool)
    }
}

/// Pool of external worker processes
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    pub fn builder(config: ConfigHandle) -> PoolBuilder {
        PoolBuilder {
            config,
            telemetry: None,
        }
    }

    /// Start a pool with the default telemetry
    pub async fn start(config: ConfigHandle) -> PoolResult<Pool> {
        Self::builder(config).start().await
    }

    /// Validate `config`, wrap it in a handle, and start a pool
    pub async fn from_config(config: SnakepitConfig) -> PoolResult<Pool> {
        Self::start(ConfigHandle::new(config)?).await
    }

    /// The live configuration; updates apply from the next decision on
    pub fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    /// Take exclusive ownership of a worker
    ///
    /// Prefers the worker bound to `session_id` when it is Ready; otherwise the
    /// longest-idle Ready worker whose circuit admits. Waits in FIFO order up
    /// to `timeout` (the configured checkout timeout when `None`).
    pub async fn checkout(
        &self,
        session_id: Option<&str>,
        timeout_override: Option<Duration>,
    ) -> PoolResult<WorkerHandle> {
        let wait = timeout_override.unwrap_or_else(|| self.inner.config.read(|c| c.pool.checkout_timeout));
        let started = Instant::now();

        let (waiter_id, mut rx) = {
            let mut state = self.inner.state.lock();
            match self.inner.assign(&mut state, session_id, Duration::ZERO) {
                Assignment::Granted(handle) => return Ok(handle),
                Assignment::Rejected(e) => return Err(e),
                Assignment::Unavailable => {}
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter {
                id,
                session_id: session_id.map(str::to_string),
                enqueued_at: started,
                tx,
            });
            debug!(
                session_id = session_id.unwrap_or("-"),
                queue_length = state.waiters.len(),
                "No worker available; waiting"
            );
            self.inner.maybe_start_overflow(&mut state);
            (id, rx)
        };

        match timeout(wait, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::PoolShutdown),
            Err(_) => {
                self.inner.state.lock().waiters.retain(|w| w.id != waiter_id);
                // A handle may have been granted between the deadline and the lock
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::CheckoutTimeout {
                        waited: started.elapsed(),
                    }),
                }
            }
        }
    }

    /// Give a worker back
    ///
    /// `Healthy` returns it to Ready and refreshes the session's affinity.
    /// `Unhealthy` removes it from the registry at once, terminates it in the
    /// background and starts a replacement. A poisoned handle is evicted even
    /// when declared healthy. Handles the pool no longer knows are ignored.
    pub fn checkin(&self, handle: WorkerHandle, outcome: CheckinOutcome) {
        if let Some(lease) = handle.into_lease() {
            self.inner.release(lease, outcome);
        }
    }

    /// Forget a session and ask its worker to drop session state
    ///
    /// Returns whether the session had an affinity entry. The cleanup runs in
    /// the background and only when the worker is idle.
    pub fn end_session(&self, session_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(worker_id) = state.affinity.remove(session_id) else {
            return false;
        };
        debug!(session_id, worker_id = %worker_id, "Session ended");
        self.inner.cleanup_session(&mut state, session_id, &worker_id);
        true
    }

    /// Point-in-time view of workers, queue, sessions and circuits
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut workers: Vec<WorkerSnapshot> = state.workers.values().map(WorkerRecord::snapshot).collect();
        workers.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.id.cmp(&b.id)));

        PoolStats {
            workers,
            starting: state.starting.len(),
            queue_length: state.waiters.len(),
            session_count: state.affinity.len(),
            pool_circuit: self.inner.circuits.find(CircuitScope::Pool).map(|b| b.state()),
            circuits: self.inner.circuits.states(),
            shutting_down: state.shutting_down,
        }
    }

    /// Events raised when the pool cannot keep `min_ready` workers alive
    pub fn subscribe_escalations(&self) -> broadcast::Receiver<Escalation> {
        self.inner.escalations.subscribe()
    }

    /// Stop the pool
    ///
    /// Queued checkouts fail with [`PoolError::PoolShutdown`], background tasks
    /// stop, affinity is cleared and idle workers are terminated concurrently.
    /// Workers still checked out are terminated when they are checked in; a
    /// repeated call waits for those terminations.
    pub async fn shutdown(&self) {
        let waiters: Option<Vec<Waiter>> = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                None
            } else {
                state.shutting_down = true;
                state.affinity.clear();
                self.inner.retire_ready(&mut state);
                info!(busy = state.workers.len(), "Shutting down worker pool");
                Some(state.waiters.drain(..).collect())
            }
        };

        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.tx.send(Err(PoolError::PoolShutdown));
            }
            if let Err(e) = self.inner.shutdown.signal(ShutdownSignal::Graceful) {
                debug!("Shutdown signal not sent: {}", e);
            }
        }
        let background = std::mem::take(&mut *self.inner.background.lock());
        join_all(background).await;

        // Finished starts and late checkins queue terminations of their own
        loop {
            let jobs = std::mem::take(&mut *self.inner.jobs.lock());
            if jobs.is_empty() {
                break;
            }
            join_all(jobs).await;
        }
        info!("Worker pool shut down");
    }
}

impl PoolInner {
    fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    fn track(&self, job: JoinHandle<()>) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|j| !j.is_finished());
        jobs.push(job);
    }

    fn breakers_enabled(&self) -> Option<CircuitBreakerSettings> {
        let settings = self.config.read(|c| c.circuit_breaker.clone());
        if !settings.enabled {
            return None;
        }
        self.circuits.configure(&breaker_config(&settings));
        Some(settings)
    }

    fn pool_breaker(&self, settings: &CircuitBreakerSettings) -> Option<CircuitBreaker> {
        settings
            .pool_scope
            .then(|| self.circuits.get(CircuitScope::Pool))
    }

    /// Pick and lease a worker for a caller
    fn assign(&self, state: &mut PoolState, session_id: Option<&str>, waited: Duration) -> Assignment {
        if state.shutting_down {
            return Assignment::Rejected(PoolError::PoolShutdown);
        }

        let breakers = self.breakers_enabled();
        let pool_breaker = breakers.as_ref().and_then(|s| self.pool_breaker(s));
        if let Some(breaker) = &pool_breaker {
            if !breaker.would_admit() {
                return Assignment::Rejected(PoolError::CircuitOpen {
                    scope: CircuitScope::Pool,
                    retry_after: breaker.retry_after(),
                });
            }
        }

        let slot_admits =
            |slot: usize| breakers.is_none() || self.circuits.get(CircuitScope::Slot(slot)).would_admit();
        let affinity_enabled = self.config.read(|c| c.affinity.enabled);

        let mut chosen = None;
        let mut affinity_hit = false;
        if let (Some(session), true) = (session_id, affinity_enabled) {
            match state.affinity.lookup(session) {
                AffinityLookup::Hit(worker_id) => {
                    if let Some(record) = state.workers.get(&worker_id) {
                        if record.state == WorkerState::Ready && slot_admits(record.slot) {
                            chosen = Some(worker_id);
                            affinity_hit = true;
                        }
                    }
                }
                AffinityLookup::Expired(worker_id) => {
                    debug!(session_id = session, worker_id = %worker_id, "Session affinity expired");
                }
                AffinityLookup::Miss => {}
            }
        }

        if chosen.is_none() {
            chosen = state
                .workers
                .values()
                .filter(|r| r.state == WorkerState::Ready && slot_admits(r.slot))
                .min_by_key(|r| r.idle_since)
                .map(|r| r.id.clone());
        }

        let Some(worker_id) = chosen else {
            return self.unavailable(state, breakers.is_some());
        };
        let Some(slot) = state.workers.get(&worker_id).map(|r| r.slot) else {
            return Assignment::Unavailable;
        };

        let slot_admission = match &breakers {
            Some(_) => self.circuits.get(CircuitScope::Slot(slot)).try_acquire(),
            None => Admission::Allowed,
        };
        if !slot_admission.is_admitted() {
            return Assignment::Unavailable;
        }
        let pool_admission = pool_breaker
            .as_ref()
            .map_or(Admission::Allowed, CircuitBreaker::try_acquire);
        if let Admission::Rejected { retry_after } = pool_admission {
            if slot_admission == Admission::Trial {
                self.circuits.get(CircuitScope::Slot(slot)).abandon_trial();
            }
            return Assignment::Rejected(PoolError::CircuitOpen {
                scope: CircuitScope::Pool,
                retry_after,
            });
        }

        let session = if affinity_enabled { session_id } else { None };
        match self.lease_worker(state, &worker_id, LeaseKind::Caller, session, slot_admission, pool_admission) {
            Some(handle) => {
                self.telemetry.on_checkout(&CheckoutEvent {
                    worker_id,
                    session_id: session_id.map(str::to_string),
                    affinity_hit,
                    waited,
                });
                Assignment::Granted(handle)
            }
            None => {
                self.abandon_trials(slot, slot_admission, pool_admission);
                Assignment::Unavailable
            }
        }
    }

    /// Nothing assignable: fail fast if open circuits block every idle worker
    /// and no other worker can free up, otherwise let the caller wait
    fn unavailable(&self, state: &PoolState, breakers_enabled: bool) -> Assignment {
        if !breakers_enabled {
            return Assignment::Unavailable;
        }
        let pending = !state.starting.is_empty()
            || state.workers.values().any(|r| r.state == WorkerState::Busy);
        let blocked: Vec<usize> = state
            .workers
            .values()
            .filter(|r| r.state == WorkerState::Ready)
            .map(|r| r.slot)
            .collect();
        if pending || blocked.is_empty() {
            return Assignment::Unavailable;
        }

        let (scope, retry_after) = blocked
            .iter()
            .map(|slot| {
                let scope = CircuitScope::Slot(*slot);
                (scope, self.circuits.get(scope).retry_after())
            })
            .min_by_key(|(_, retry_after)| retry_after.unwrap_or(Duration::MAX))
            .unwrap_or((CircuitScope::Pool, None));
        Assignment::Rejected(PoolError::CircuitOpen { scope, retry_after })
    }

    /// Mark a Ready worker Busy and wrap its channel in a handle
    fn lease_worker(
        &self,
        state: &mut PoolState,
        worker_id: &WorkerId,
        kind: LeaseKind,
        session_id: Option<&str>,
        slot_admission: Admission,
        pool_admission: Admission,
    ) -> Option<WorkerHandle> {
        let record = state.workers.get_mut(worker_id)?;
        if record.state != WorkerState::Ready {
            return None;
        }
        let Some(channel) = record.channel.take() else {
            error!(worker_id = %worker_id, "Ready worker has no channel");
            return None;
        };
        transition(&record.id, &mut record.state, WorkerState::Busy);

        let token = Uuid::new_v4();
        record.lease = Some(token);
        if kind == LeaseKind::Caller {
            record.requests_served += 1;
        }
        if let Some(session) = session_id {
            record.bound_session = Some(session.to_string());
        }
        let slot = record.slot;
        if let Some(session) = session_id {
            state.affinity.bind(session, worker_id);
        }

        Some(WorkerHandle::new(
            Lease {
                worker_id: worker_id.clone(),
                slot,
                token,
                kind,
                session_id: session_id.map(str::to_string),
                channel: Some(channel),
                slot_admission,
                pool_admission,
                checked_out_at: Instant::now(),
                used: false,
            },
            self.events.clone(),
        ))
    }

    fn abandon_trials(&self, slot: usize, slot_admission: Admission, pool_admission: Admission) {
        if slot_admission == Admission::Trial {
            self.circuits.get(CircuitScope::Slot(slot)).abandon_trial();
        }
        if pool_admission == Admission::Trial {
            self.circuits.get(CircuitScope::Pool).abandon_trial();
        }
    }

    /// Hand Ready workers to queued callers in FIFO order
    fn dispatch(self: &Arc<Self>, state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let waited = waiter.enqueued_at.elapsed();
            match self.assign(state, waiter.session_id.as_deref(), waited) {
                Assignment::Granted(handle) => {
                    if let Err(Ok(handle)) = waiter.tx.send(Ok(handle)) {
                        if let Some(lease) = handle.into_lease() {
                            self.restore_unused(state, lease);
                        }
                    }
                }
                Assignment::Rejected(e) => {
                    let _ = waiter.tx.send(Err(e));
                }
                Assignment::Unavailable => {
                    state.waiters.push_front(waiter);
                    break;
                }
            }
        }
        self.maybe_start_overflow(state);
        self.retire_idle_overflow(state);
    }

    /// Return a lease that never reached its holder; no outcome is recorded
    fn restore_unused(self: &Arc<Self>, state: &mut PoolState, lease: Lease) {
        self.abandon_trials(lease.slot, lease.slot_admission, lease.pool_admission);
        let Some(record) = state.workers.get_mut(&lease.worker_id) else {
            return;
        };
        if record.lease != Some(lease.token) {
            return;
        }
        record.lease = None;
        record.channel = lease.channel;
        if lease.kind == LeaseKind::Caller {
            record.requests_served = record.requests_served.saturating_sub(1);
        }
        transition(&record.id, &mut record.state, WorkerState::Ready);
    }

    pub(crate) fn release(self: &Arc<Self>, lease: Lease, outcome: CheckinOutcome) {
        let mut state = self.state.lock();
        self.release_locked(&mut state, lease, outcome, EvictionReason::CheckedInUnhealthy);
    }

    fn release_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        lease: Lease,
        outcome: CheckinOutcome,
        reason: EvictionReason,
    ) {
        let current = state
            .workers
            .get(&lease.worker_id)
            .is_some_and(|r| r.lease == Some(lease.token));
        if !current {
            warn!(worker_id = %lease.worker_id, "Checkin of a handle the pool no longer tracks; ignoring");
            if lease.holds_trial() {
                self.abandon_trials(lease.slot, lease.slot_admission, lease.pool_admission);
            }
            return;
        }

        let poisoned = lease.channel.as_ref().map_or(true, WorkerChannel::is_poisoned);
        let outcome = if outcome == CheckinOutcome::Healthy && poisoned {
            warn!(worker_id = %lease.worker_id, "Poisoned channel checked in as healthy; evicting");
            CheckinOutcome::Unhealthy
        } else {
            outcome
        };

        if lease.kind == LeaseKind::Caller {
            self.record_outcome(lease.slot, outcome, lease.slot_admission, lease.pool_admission);
            self.telemetry.on_checkin(&CheckinEvent {
                worker_id: lease.worker_id.clone(),
                session_id: lease.session_id.clone(),
                outcome,
                held: lease.checked_out_at.elapsed(),
            });
        }

        let Some(mut record) = state.workers.remove(&lease.worker_id) else {
            return;
        };
        record.lease = None;
        record.channel = lease.channel;

        match outcome {
            CheckinOutcome::Healthy => {
                transition(&record.id, &mut record.state, WorkerState::Ready);
                record.idle_since = Instant::now();
                if let Some(session) = &lease.session_id {
                    if !state.affinity.refresh(session) && !state.shutting_down {
                        state.affinity.bind(session, &record.id);
                    }
                }
                if state.shutting_down {
                    self.retire(state, record, EvictionReason::Shutdown);
                    return;
                }
                state.workers.insert(record.id.clone(), record);
            }
            CheckinOutcome::Unhealthy => {
                transition(&record.id, &mut record.state, WorkerState::Unhealthy);
                self.evict(state, record, reason);
            }
        }
        self.dispatch(state);
    }

    /// Feed an outcome to the slot and pool breakers under the admissions it was granted
    fn record_outcome(
        &self,
        slot: usize,
        outcome: CheckinOutcome,
        slot_admission: Admission,
        pool_admission: Admission,
    ) {
        let Some(settings) = self.breakers_enabled() else {
            return;
        };
        let mut breakers = vec![(self.circuits.get(CircuitScope::Slot(slot)), slot_admission)];
        breakers.extend(self.pool_breaker(&settings).map(|b| (b, pool_admission)));
        let success = outcome == CheckinOutcome::Healthy;
        for (breaker, admission) in breakers {
            match (admission, success) {
                (Admission::Trial, _) => breaker.record_trial(success),
                (_, true) => breaker.record_success(),
                (_, false) => breaker.record_failure(),
            };
        }
    }

    /// Remove a failed worker: terminate it and start a replacement in its slot
    fn evict(self: &Arc<Self>, state: &mut PoolState, record: WorkerRecord, reason: EvictionReason) {
        let slot = record.slot;
        let overflow = record.overflow;
        self.retire(state, record, reason);
        if !overflow {
            self.spawn_replacement(state, slot);
        }
    }

    /// Take a worker out of service and terminate it in the background
    fn retire(&self, state: &mut PoolState, record: WorkerRecord, reason: EvictionReason) {
        let WorkerRecord {
            id,
            slot,
            state: mut worker_state,
            channel,
            monitor,
            ..
        } = record;

        let unbound = state.affinity.remove_worker(&id);
        if unbound > 0 {
            debug!(worker_id = %id, sessions = unbound, "Dropped affinity entries of departing worker");
        }
        self.telemetry.on_eviction(&EvictionEvent {
            worker_id: id.clone(),
            slot,
            reason,
        });

        transition(&id, &mut worker_state, WorkerState::Terminating);
        let shutdown_timeout = self.config.read(|c| c.worker.shutdown_timeout);
        self.track(tokio::spawn(async move {
            terminate_worker(id.clone(), channel, monitor, shutdown_timeout).await;
            transition(&id, &mut worker_state, WorkerState::Terminated);
        }));
    }

    /// Terminate every idle worker during shutdown
    fn retire_ready(&self, state: &mut PoolState) {
        let idle: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|r| r.state == WorkerState::Ready)
            .map(|r| r.id.clone())
            .collect();
        for id in idle {
            if let Some(record) = state.workers.remove(&id) {
                self.retire(state, record, EvictionReason::Shutdown);
            }
        }
    }

    /// Start a worker for an empty base slot in the background
    fn spawn_replacement(self: &Arc<Self>, state: &mut PoolState, slot: usize) {
        let size = self.config.read(|c| c.pool.size);
        if state.shutting_down || slot >= size || state.slot_taken(slot) {
            return;
        }
        info!(slot, "Starting replacement worker");
        self.spawn_start(state, slot, false);
    }

    fn spawn_start(self: &Arc<Self>, state: &mut PoolState, slot: usize, overflow: bool) {
        state.starting.insert(slot);
        let budget = self.config.read(|c| c.pool.startup_timeout);
        let inner = self.clone();
        self.track(tokio::spawn(async move {
            let result = inner.start_worker(slot, Some(budget)).await;
            inner.finish_start(slot, overflow, result);
        }));
    }

    /// Spawn and handshake a worker for `slot`, retrying per the pool's policy
    async fn start_worker(
        self: &Arc<Self>,
        slot: usize,
        budget: Option<Duration>,
    ) -> Result<SpawnedWorker, StartFailure> {
        let (launch, attempts, delay) = self.config.read(|c| {
            (
                c.worker.clone(),
                c.pool.max_start_attempts,
                c.pool.start_retry_delay,
            )
        });
        let executor =
            RetryExecutor::new(RetryPolicy::exponential(attempts, delay).with_budget(budget));

        executor
            .execute_with_context(|attempt| {
                let launch = launch.clone();
                let events = self.events.clone();
                let inner = self.clone();
                async move {
                    if inner.is_shutting_down() {
                        return Err(InitializationFailure::Cancelled { slot });
                    }
                    debug!(slot, attempt, "Starting worker");
                    spawn_worker(slot, &launch, events).await
                }
            })
            .await
            .map_err(|e| StartFailure::new(slot, e))
    }

    fn finish_start(
        self: &Arc<Self>,
        slot: usize,
        overflow: bool,
        result: Result<SpawnedWorker, StartFailure>,
    ) {
        let mut state = self.state.lock();
        state.starting.remove(&slot);
        match result {
            Ok(worker) => self.admit(&mut state, worker, overflow),
            Err(StartFailure {
                attempts,
                error: last_error,
            }) => {
                error!(slot, attempts, "Worker start gave up: {}", last_error);

                let live = state.live_count();
                let min_ready = self.config.read(|c| c.pool.min_ready);
                if !overflow && !state.shutting_down && live < min_ready {
                    error!(live, min_ready, "Live workers below minimum; escalating");
                    let _ = self.escalations.send(Escalation {
                        slot,
                        attempts,
                        live_workers: live,
                        min_ready,
                        last_error: last_error.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        }
        self.dispatch(&mut state);
    }

    /// Register a handshaken worker as Ready
    fn admit(self: &Arc<Self>, state: &mut PoolState, worker: SpawnedWorker, overflow: bool) {
        let SpawnedWorker {
            id,
            slot,
            channel,
            monitor,
        } = worker;
        let mut record = WorkerRecord {
            id,
            slot,
            overflow,
            state: WorkerState::Initializing,
            channel: Some(channel),
            lease: None,
            monitor,
            bound_session: None,
            requests_served: 0,
            consecutive_failures: 0,
            last_health_check: None,
            idle_since: Instant::now(),
            started_at: Utc::now(),
        };

        if state.shutting_down {
            self.retire(state, record, EvictionReason::Shutdown);
            return;
        }
        // Its exit event found no record, so it has to be caught here
        if record.monitor.has_exited() {
            error!(worker_id = %record.id, slot, "Worker exited between handshake and admission");
            transition(&record.id, &mut record.state, WorkerState::Terminated);
            self.record_outcome(slot, CheckinOutcome::Unhealthy, Admission::Allowed, Admission::Allowed);
            self.telemetry.on_eviction(&EvictionEvent {
                worker_id: record.id,
                slot,
                reason: EvictionReason::ProcessExited("exited before admission".to_string()),
            });
            if !overflow {
                self.spawn_replacement(state, slot);
            }
            self.dispatch(state);
            return;
        }
        transition(&record.id, &mut record.state, WorkerState::Ready);
        state.workers.insert(record.id.clone(), record);
        self.dispatch(state);
    }

    /// Start overflow workers while callers wait and every worker is busy
    fn maybe_start_overflow(self: &Arc<Self>, state: &mut PoolState) {
        if state.shutting_down || state.waiters.is_empty() {
            return;
        }
        if state.workers.values().any(|r| r.state == WorkerState::Ready) {
            return;
        }
        if state.starting.len() >= state.waiters.len() {
            return;
        }
        let (size, max_overflow) = self.config.read(|c| (c.pool.size, c.pool.max_overflow));
        let Some(slot) = (size..size + max_overflow).find(|slot| !state.slot_taken(*slot)) else {
            return;
        };
        info!(slot, waiters = state.waiters.len(), "All workers busy; starting overflow worker");
        self.spawn_start(state, slot, true);
    }

    fn retire_idle_overflow(&self, state: &mut PoolState) {
        if !state.waiters.is_empty() {
            return;
        }
        let idle: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|r| r.overflow && r.state == WorkerState::Ready)
            .map(|r| r.id.clone())
            .collect();
        for id in idle {
            if let Some(record) = state.workers.remove(&id) {
                self.retire(state, record, EvictionReason::OverflowRetired);
            }
        }
    }

    /// Start workers for base slots that are neither occupied nor starting
    pub(crate) fn replenish(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let size = self.config.read(|c| c.pool.size);
        for slot in 0..size {
            self.spawn_replacement(&mut state, slot);
        }
        self.dispatch(&mut state);
    }

    /// A worker process exited on its own
    fn on_process_exit(self: &Arc<Self>, worker_id: WorkerId, reason: String) {
        let mut state = self.state.lock();
        let Some(mut record) = state.workers.remove(&worker_id) else {
            debug!(worker_id = %worker_id, "Exit of a worker no longer registered: {}", reason);
            return;
        };
        error!(worker_id = %worker_id, slot = record.slot, state = %record.state, "Worker died: {}", reason);
        transition(&record.id, &mut record.state, WorkerState::Terminated);
        self.record_outcome(
            record.slot,
            CheckinOutcome::Unhealthy,
            Admission::Allowed,
            Admission::Allowed,
        );

        state.affinity.remove_worker(&worker_id);
        self.telemetry.on_eviction(&EvictionEvent {
            worker_id,
            slot: record.slot,
            reason: EvictionReason::ProcessExited(reason),
        });
        if !record.overflow {
            self.spawn_replacement(&mut state, record.slot);
        }
        self.dispatch(&mut state);
    }

    fn on_lease_dropped(self: &Arc<Self>, lease: Lease) {
        if lease.used {
            let outcome = match &lease.channel {
                Some(channel) if !channel.is_poisoned() => CheckinOutcome::Healthy,
                _ => CheckinOutcome::Unhealthy,
            };
            self.release(lease, outcome);
        } else {
            let mut state = self.state.lock();
            self.restore_unused(&mut state, lease);
            if state.shutting_down {
                self.retire_ready(&mut state);
                return;
            }
            self.dispatch(&mut state);
        }
    }

    /// Send `cleanup_session` to the session's worker if it is idle
    fn cleanup_session(self: &Arc<Self>, state: &mut PoolState, session_id: &str, worker_id: &WorkerId) {
        if let Some(record) = state.workers.get_mut(worker_id) {
            if record.bound_session.as_deref() == Some(session_id) {
                record.bound_session = None;
            }
        }
        let Some(mut handle) = self.lease_worker(
            state,
            worker_id,
            LeaseKind::Maintenance,
            None,
            Admission::Allowed,
            Admission::Allowed,
        ) else {
            debug!(session_id, worker_id = %worker_id, "Worker not idle; skipping session cleanup");
            return;
        };

        let inner = self.clone();
        let session_id = session_id.to_string();
        let deadline = self.config.read(|c| c.health.probe_timeout);
        self.track(tokio::spawn(async move {
            let result = handle
                .call_command::<CleanupSession>(
                    &CleanupSessionArgs {
                        session_id: session_id.clone(),
                    },
                    deadline,
                )
                .await;
            match &result {
                Ok(response) => debug!(session_id = %session_id, "Session cleanup: {}", response.status),
                Err(e) => warn!(session_id = %session_id, "Session cleanup failed: {}", e),
            }
            let outcome = CheckinOutcome::for_result(&result);
            if let Some(lease) = handle.into_lease() {
                inner.release(lease, outcome);
            }
        }));
    }

    /// Expire stale affinity entries and clean up their sessions
    fn sweep_affinity(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let expired = state.affinity.expire_sweep();
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "Expired session affinity entries");
        for (session_id, worker_id) in expired {
            self.cleanup_session(&mut state, &session_id, &worker_id);
        }
    }

    /// Lease idle workers that are due a health probe
    pub(crate) fn lease_for_probe(self: &Arc<Self>, idle_threshold: Duration) -> Vec<WorkerHandle> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Vec::new();
        }
        let due: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|r| r.state == WorkerState::Ready && r.idle_since.elapsed() >= idle_threshold)
            .map(|r| r.id.clone())
            .collect();
        due.iter()
            .filter_map(|id| {
                self.lease_worker(
                    &mut state,
                    id,
                    LeaseKind::Probe,
                    None,
                    Admission::Allowed,
                    Admission::Allowed,
                )
            })
            .collect()
    }

    /// Record a probe result and return the worker
    pub(crate) fn finish_probe(
        self: &Arc<Self>,
        handle: WorkerHandle,
        result: PoolResult<()>,
        latency: Duration,
    ) {
        let Some(lease) = handle.into_lease() else {
            return;
        };
        let max_failures = self.config.read(|c| c.health.max_probe_failures);
        let mut state = self.state.lock();

        let Some(record) = state
            .workers
            .get_mut(&lease.worker_id)
            .filter(|r| r.lease == Some(lease.token))
        else {
            debug!(worker_id = %lease.worker_id, "Probe finished for a worker no longer registered");
            return;
        };

        record.last_health_check = Some(Utc::now());
        let healthy = result.is_ok();
        if healthy {
            record.consecutive_failures = 0;
            // Next probe is due one idle threshold from now
            record.idle_since = Instant::now();
        } else {
            record.consecutive_failures += 1;
        }
        let failures = record.consecutive_failures;

        self.telemetry.on_health_probe(&ProbeEvent {
            worker_id: lease.worker_id.clone(),
            healthy,
            latency,
            consecutive_failures: failures,
        });

        let outcome = if failures >= max_failures {
            CheckinOutcome::Unhealthy
        } else {
            CheckinOutcome::Healthy
        };
        self.release_locked(&mut state, lease, outcome, EvictionReason::ProbeFailed);
    }
}

/// Drain process-exit and dropped-handle events
async fn event_loop(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        match event {
            PoolEvent::ProcessExited { worker_id, reason } => inner.on_process_exit(worker_id, reason),
            PoolEvent::LeaseDropped(lease) => inner.on_lease_dropped(lease),
        }
    }
    debug!("Pool event loop stopped");
}

/// Periodically purge expired affinity entries
async fn sweep_loop(pool: Weak<PoolInner>, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
    loop {
        let Some(interval) = pool
            .upgrade()
            .map(|inner| inner.config.read(|c| c.affinity.sweep_interval))
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
        inner.sweep_affinity();
    }
    debug!("Affinity sweeper stopped");
}
