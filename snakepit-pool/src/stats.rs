//! Point-in-time pool snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use snakepit_resilience::{CircuitScope, CircuitState};

use crate::worker::{WorkerId, WorkerState};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub slot: usize,
    pub state: WorkerState,
    pub overflow: bool,
    pub pid: Option<u32>,
    pub bound_session: Option<String>,
    pub requests_served: u64,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Registered workers, ordered by slot
    pub workers: Vec<WorkerSnapshot>,
    /// Workers still spawning or handshaking
    pub starting: usize,
    pub queue_length: usize,
    pub session_count: usize,
    pub pool_circuit: Option<CircuitState>,
    pub circuits: Vec<(CircuitScope, CircuitState)>,
    pub shutting_down: bool,
}

impl PoolStats {
    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    /// Ready plus Busy workers
    pub fn live(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_live()).count()
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| &w.id == id)
    }
}
