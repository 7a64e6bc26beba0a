//! Domain-driven configuration management for Snakepit
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, environment variable support, and a shared
//! handle through which running components read the *current* values.

pub mod error;
pub mod handle;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use handle::ConfigHandle;
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    affinity::AffinityConfig,
    circuit_breaker::CircuitBreakerSettings,
    health::HealthConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::PoolConfig,
    worker::WorkerLaunchConfig,
    SnakepitConfig,
};
