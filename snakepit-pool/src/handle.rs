//! Exclusive worker handles handed out by checkout

use serde_json::Value as JsonValue;
use snakepit_ipc::{Command, PingResponse, Response};
use snakepit_resilience::Admission;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::channel::WorkerChannel;
use crate::error::PoolError;
use crate::worker::WorkerId;

/// Caller-declared result of holding a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// The worker can serve further requests
    Healthy,
    /// The worker must be evicted and replaced
    Unhealthy,
}

impl CheckinOutcome {
    /// Outcome matching the result of an exchange
    pub fn for_result<T>(result: &Result<T, PoolError>) -> Self {
        match result {
            Err(e) if e.requires_eviction() => CheckinOutcome::Unhealthy,
            _ => CheckinOutcome::Healthy,
        }
    }
}

impl fmt::Display for CheckinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckinOutcome::Healthy => write!(f, "healthy"),
            CheckinOutcome::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Who is holding a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseKind {
    /// A checkout through the public API
    Caller,
    /// The health monitor's idle probe
    Probe,
    /// Pool-issued control traffic such as `cleanup_session`
    Maintenance,
}

/// Bookkeeping for one checkout, returned to the coordinator on checkin
#[derive(Debug)]
pub(crate) struct Lease {
    pub worker_id: WorkerId,
    pub slot: usize,
    pub token: Uuid,
    pub kind: LeaseKind,
    pub session_id: Option<String>,
    pub channel: Option<WorkerChannel>,
    pub slot_admission: Admission,
    pub pool_admission: Admission,
    pub checked_out_at: Instant,
    pub used: bool,
}

impl Lease {
    /// Move the lease out, leaving `self` without a channel
    fn detach(&mut self) -> Option<Lease> {
        let channel = self.channel.take()?;
        Some(Lease {
            worker_id: self.worker_id.clone(),
            slot: self.slot,
            token: self.token,
            kind: self.kind,
            session_id: self.session_id.clone(),
            channel: Some(channel),
            slot_admission: self.slot_admission,
            pool_admission: self.pool_admission,
            checked_out_at: self.checked_out_at,
            used: self.used,
        })
    }

    /// Whether this lease claimed a half-open trial in either scope
    pub fn holds_trial(&self) -> bool {
        self.slot_admission == Admission::Trial || self.pool_admission == Admission::Trial
    }
}

/// Messages delivered to the coordinator's event loop
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A worker process exited without being asked to
    ProcessExited { worker_id: WorkerId, reason: String },
    /// A handle was dropped without being checked in
    LeaseDropped(Lease),
}

/// Exclusive ownership of one worker's channel
///
/// The caller talks to the worker directly through the handle; the pool is
/// not involved until the handle is given back with
/// [`Pool::checkin`](crate::Pool::checkin). A handle dropped without checkin
/// is returned by the pool itself, as unhealthy if its channel is poisoned.
pub struct WorkerHandle {
    lease: Lease,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerHandle {
    pub(crate) fn new(lease: Lease, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self { lease, events }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.lease.worker_id
    }

    /// Slot the worker occupies; replacements inherit it
    pub fn slot(&self) -> usize {
        self.lease.slot
    }

    pub fn session_id(&self) -> Option<&str> {
        self.lease.session_id.as_deref()
    }

    /// Whether an exchange was abandoned, making the channel unusable
    pub fn is_poisoned(&self) -> bool {
        self.lease
            .channel
            .as_ref()
            .map_or(true, WorkerChannel::is_poisoned)
    }

    /// Time since checkout
    pub fn held_for(&self) -> Duration {
        self.lease.checked_out_at.elapsed()
    }

    /// Exchange one request, returning the raw response
    pub async fn request(
        &mut self,
        command: &str,
        args: JsonValue,
        deadline: Duration,
    ) -> Result<Response, PoolError> {
        self.channel()?.request(command, args, deadline).await
    }

    /// Exchange one request; an error response becomes `PoolError::Worker`
    pub async fn call(
        &mut self,
        command: &str,
        args: JsonValue,
        deadline: Duration,
    ) -> Result<JsonValue, PoolError> {
        self.channel()?.call(command, args, deadline).await
    }

    /// Exchange a declared command with typed arguments and response
    pub async fn call_command<C: Command>(
        &mut self,
        args: &C::Args,
        deadline: Duration,
    ) -> Result<C::Response, PoolError> {
        self.channel()?.call_command::<C>(args, deadline).await
    }

    /// Send a `ping` probe with a fresh nonce
    pub async fn probe(&mut self, deadline: Duration) -> Result<PingResponse, PoolError> {
        self.channel()?.probe(deadline).await
    }

    pub(crate) fn into_lease(mut self) -> Option<Lease> {
        self.lease.detach()
    }

    fn channel(&mut self) -> Result<&mut WorkerChannel, PoolError> {
        self.lease.used = true;
        let worker_id = self.lease.worker_id.clone();
        self.lease
            .channel
            .as_mut()
            .ok_or(PoolError::ChannelPoisoned { worker_id })
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.lease.worker_id)
            .field("slot", &self.lease.slot)
            .field("session_id", &self.lease.session_id)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.detach() {
            debug!(worker_id = %lease.worker_id, "Handle dropped without checkin");
            // A closed event loop means the pool is gone; dropping the channel closes the pipes
            let _ = self.events.send(PoolEvent::LeaseDropped(lease));
        }
    }
}
