//! Circuit breaker configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker settings applied to every scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Whether circuit breaking is applied at all
    #[serde(default = "crate::domains::utils::default_true")]
    pub enabled: bool,

    /// Failures within `window` that open a circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window over which failures are counted
    #[serde(with = "humantime_serde", default = "default_window")]
    pub window: Duration,

    /// Time an open circuit waits before allowing a trial
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,

    /// Also keep an aggregate breaker for the whole pool
    #[serde(default = "crate::domains::utils::default_true")]
    pub pool_scope: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            window: default_window(),
            cooldown: default_cooldown(),
            pool_scope: true,
        }
    }
}

impl Validatable for CircuitBreakerSettings {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_duration(self.window, "window", self.domain_name())?;
        validate_duration(self.cooldown, "cooldown", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "circuit_breaker"
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}
