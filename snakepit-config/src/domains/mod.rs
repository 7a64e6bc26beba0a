//! Domain-specific configuration modules

pub mod affinity;
pub mod circuit_breaker;
pub mod health;
pub mod logging;
pub mod pool;
pub mod utils;
pub mod worker;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Snakepit configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SnakepitConfig {
    /// Pool sizing and timeouts
    #[serde(default)]
    pub pool: pool::PoolConfig,

    /// How worker processes are launched and talked to
    #[serde(default)]
    pub worker: worker::WorkerLaunchConfig,

    /// Session affinity configuration
    #[serde(default)]
    pub affinity: affinity::AffinityConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: circuit_breaker::CircuitBreakerSettings,

    /// Health monitor configuration
    #[serde(default)]
    pub health: health::HealthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl SnakepitConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.worker.validate()?;
        self.affinity.validate()?;
        self.circuit_breaker.validate()?;
        self.health.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = SnakepitConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SnakepitConfig::default().validate_all().is_ok());
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = SnakepitConfig::generate_sample();
        let parsed: SnakepitConfig = serde_yaml::from_str(&sample).unwrap();
        assert_eq!(parsed, SnakepitConfig::default());
    }

    #[test]
    fn test_invalid_domain_is_reported() {
        let mut config = SnakepitConfig::default();
        config.pool.size = 0;
        let err = config.validate_all().unwrap_err();
        assert!(err.to_string().contains("pool"));
    }
}
