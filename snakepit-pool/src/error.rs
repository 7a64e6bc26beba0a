//! Error types for the worker pool

use snakepit_config::ConfigError;
use snakepit_ipc::IpcError;
use snakepit_resilience::{CircuitScope, Retryable};
use std::time::Duration;
use thiserror::Error;

use crate::worker::WorkerId;

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to callers of the pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No worker became available within {waited:?}")]
    CheckoutTimeout { waited: Duration },

    #[error("Worker {worker_id} did not answer within {after:?}")]
    OperationTimeout { worker_id: WorkerId, after: Duration },

    #[error("Worker {worker_id} crashed: {reason}")]
    WorkerCrash { worker_id: WorkerId, reason: String },

    #[error("Circuit {scope} is open")]
    CircuitOpen {
        scope: CircuitScope,
        retry_after: Option<Duration>,
    },

    /// The worker answered with an error response
    #[error("Worker error: {message}")]
    Worker {
        message: String,
        traceback: Option<String>,
    },

    #[error("Channel to worker {worker_id} is poisoned by an abandoned exchange")]
    ChannelPoisoned { worker_id: WorkerId },

    #[error("Pool is shut down")]
    PoolShutdown,

    #[error("Pool started {ready} of the {required} workers it needs (gave up after {attempts} attempts)")]
    StartFailed {
        ready: usize,
        required: usize,
        /// Most attempts any failed slot made
        attempts: u32,
    },

    #[error("Protocol error talking to worker {worker_id}: {source}")]
    Ipc {
        worker_id: WorkerId,
        #[source]
        source: IpcError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Whether the worker involved must be checked in as unhealthy
    pub fn requires_eviction(&self) -> bool {
        matches!(
            self,
            PoolError::OperationTimeout { .. }
                | PoolError::WorkerCrash { .. }
                | PoolError::ChannelPoisoned { .. }
                | PoolError::Ipc { .. }
        )
    }

    /// Whether retrying the whole operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::CheckoutTimeout { .. }
                | PoolError::CircuitOpen { .. }
                | PoolError::WorkerCrash { .. }
                | PoolError::OperationTimeout { .. }
        )
    }

    /// Classify a transport failure on the channel to `worker_id`
    pub(crate) fn from_ipc(worker_id: &WorkerId, error: IpcError) -> Self {
        if error.is_disconnect() {
            PoolError::WorkerCrash {
                worker_id: worker_id.clone(),
                reason: error.to_string(),
            }
        } else {
            PoolError::Ipc {
                worker_id: worker_id.clone(),
                source: error,
            }
        }
    }
}

/// A worker instance that could not be brought to Ready
///
/// Kept apart from [`PoolError`]: it is consumed by the start and replacement
/// supervisor and never handed to a caller as an operation result.
#[derive(Error, Debug, Clone)]
pub enum InitializationFailure {
    #[error("Failed to spawn worker {worker_id}: {reason}")]
    Spawn {
        worker_id: WorkerId,
        reason: String,
        retryable: bool,
    },

    #[error("Worker {worker_id} handshake timed out after {timeout:?}")]
    HandshakeTimeout { worker_id: WorkerId, timeout: Duration },

    #[error("Worker {worker_id} handshake failed: {reason}")]
    HandshakeFailed { worker_id: WorkerId, reason: String },

    #[error("Worker for slot {slot} not ready within the startup budget of {budget:?}")]
    StartupBudgetExceeded { slot: usize, budget: Duration },

    #[error("Start of slot {slot} abandoned because the pool is shutting down")]
    Cancelled { slot: usize },
}

impl Retryable for InitializationFailure {
    fn is_retryable(&self) -> bool {
        match self {
            InitializationFailure::Spawn { retryable, .. } => *retryable,
            InitializationFailure::HandshakeTimeout { .. }
            | InitializationFailure::HandshakeFailed { .. } => true,
            InitializationFailure::StartupBudgetExceeded { .. }
            | InitializationFailure::Cancelled { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> WorkerId {
        WorkerId::new("worker-0-test")
    }

    #[test]
    fn test_eviction_classification() {
        assert!(PoolError::OperationTimeout {
            worker_id: id(),
            after: Duration::from_millis(10)
        }
        .requires_eviction());
        assert!(PoolError::ChannelPoisoned { worker_id: id() }.requires_eviction());
        assert!(!PoolError::Worker {
            message: "boom".into(),
            traceback: None
        }
        .requires_eviction());
        assert!(!PoolError::CheckoutTimeout {
            waited: Duration::from_secs(1)
        }
        .requires_eviction());
    }

    #[test]
    fn test_closed_channel_is_a_crash() {
        let err = PoolError::from_ipc(&id(), IpcError::ConnectionClosed);
        assert!(matches!(err, PoolError::WorkerCrash { .. }));

        let err = PoolError::from_ipc(&id(), IpcError::InvalidMessage("junk".into()));
        assert!(matches!(err, PoolError::Ipc { .. }));
        assert!(err.requires_eviction());
    }

    #[test]
    fn test_missing_executable_is_not_retried() {
        let failure = InitializationFailure::Spawn {
            worker_id: id(),
            reason: "No such file or directory".into(),
            retryable: false,
        };
        assert!(!failure.is_retryable());

        let failure = InitializationFailure::HandshakeTimeout {
            worker_id: id(),
            timeout: Duration::from_millis(200),
        };
        assert!(failure.is_retryable());
    }
}
