//! Resilience patterns for Snakepit
//!
//! Scoped circuit breakers, retry with backoff for worker start-up, and
//! escalating shutdown of worker processes and background tasks.

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use backoff::{Backoff, BackoffStrategy};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitMetrics,
    CircuitRegistry, CircuitScope, CircuitState, Transition, TransitionListener,
};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use shutdown::{
    ProcessShutdownManager, ShutdownCoordinator, ShutdownError, ShutdownSignal, TerminationPhase,
    TerminationReport,
};
