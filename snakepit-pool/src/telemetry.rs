//! Telemetry hooks
//!
//! Hooks run inside the pool's decision section and must return quickly.

use snakepit_resilience::{CircuitScope, Transition};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::handle::CheckinOutcome;
use crate::worker::WorkerId;

#[derive(Debug, Clone)]
pub struct CheckoutEvent {
    pub worker_id: WorkerId,
    pub session_id: Option<String>,
    /// Whether the worker was chosen through the session's affinity entry
    pub affinity_hit: bool,
    pub waited: Duration,
}

#[derive(Debug, Clone)]
pub struct CheckinEvent {
    pub worker_id: WorkerId,
    pub session_id: Option<String>,
    pub outcome: CheckinOutcome,
    pub held: Duration,
}

/// Why a worker left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionReason {
    CheckedInUnhealthy,
    ProcessExited(String),
    ProbeFailed,
    OverflowRetired,
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::CheckedInUnhealthy => write!(f, "checked in unhealthy"),
            EvictionReason::ProcessExited(reason) => write!(f, "process exited: {}", reason),
            EvictionReason::ProbeFailed => write!(f, "health probe failed"),
            EvictionReason::OverflowRetired => write!(f, "idle overflow worker retired"),
            EvictionReason::Shutdown => write!(f, "pool shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvictionEvent {
    pub worker_id: WorkerId,
    pub slot: usize,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub worker_id: WorkerId,
    pub healthy: bool,
    pub latency: Duration,
    pub consecutive_failures: u32,
}

/// Observer of pool activity
///
/// Every hook has an empty default so implementors pick what they need.
pub trait Telemetry: Send + Sync {
    fn on_checkout(&self, _event: &CheckoutEvent) {}

    fn on_checkin(&self, _event: &CheckinEvent) {}

    fn on_eviction(&self, _event: &EvictionEvent) {}

    fn on_circuit_transition(&self, _scope: CircuitScope, _transition: Transition) {}

    fn on_health_probe(&self, _event: &ProbeEvent) {}
}

/// Telemetry that writes structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn on_checkout(&self, event: &CheckoutEvent) {
        debug!(
            worker_id = %event.worker_id,
            session_id = event.session_id.as_deref().unwrap_or("-"),
            affinity_hit = event.affinity_hit,
            waited_ms = event.waited.as_millis() as u64,
            "checkout"
        );
    }

    fn on_checkin(&self, event: &CheckinEvent) {
        debug!(
            worker_id = %event.worker_id,
            session_id = event.session_id.as_deref().unwrap_or("-"),
            outcome = %event.outcome,
            held_ms = event.held.as_millis() as u64,
            "checkin"
        );
    }

    fn on_eviction(&self, event: &EvictionEvent) {
        match event.reason {
            EvictionReason::OverflowRetired | EvictionReason::Shutdown => {
                debug!(worker_id = %event.worker_id, slot = event.slot, "Worker removed: {}", event.reason)
            }
            _ => warn!(worker_id = %event.worker_id, slot = event.slot, "Worker evicted: {}", event.reason),
        }
    }

    fn on_circuit_transition(&self, scope: CircuitScope, transition: Transition) {
        info!(scope = %scope, "Circuit {} -> {}", transition.from, transition.to);
    }

    fn on_health_probe(&self, event: &ProbeEvent) {
        if event.healthy {
            debug!(
                worker_id = %event.worker_id,
                latency_ms = event.latency.as_millis() as u64,
                "Health probe ok"
            );
        } else {
            warn!(
                worker_id = %event.worker_id,
                consecutive_failures = event.consecutive_failures,
                "Health probe failed"
            );
        }
    }
}
