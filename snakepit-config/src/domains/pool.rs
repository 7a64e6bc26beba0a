//! Pool sizing and admission-control configuration

use crate::error::ConfigResult;
use crate::validation::{validate_at_most, validate_duration, validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Target number of workers kept alive
    #[serde(default = "default_size")]
    pub size: usize,

    /// Extra workers that may be started while callers are queued
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,

    /// Live workers below which a failed replacement is escalated
    #[serde(default = "default_min_ready")]
    pub min_ready: usize,

    /// Default time a caller may wait in the checkout queue
    #[serde(with = "humantime_serde", default = "default_checkout_timeout")]
    pub checkout_timeout: Duration,

    /// Default deadline for a single request/response exchange
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,

    /// Budget for a replacement worker to go from spawn to Ready
    #[serde(with = "humantime_serde", default = "default_startup_timeout")]
    pub startup_timeout: Duration,

    /// Attempts made to start a worker before giving up
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,

    /// Delay before the first start retry (grows exponentially)
    #[serde(with = "humantime_serde", default = "default_start_retry_delay")]
    pub start_retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            max_overflow: default_max_overflow(),
            min_ready: default_min_ready(),
            checkout_timeout: default_checkout_timeout(),
            operation_timeout: default_operation_timeout(),
            startup_timeout: default_startup_timeout(),
            max_start_attempts: default_max_start_attempts(),
            start_retry_delay: default_start_retry_delay(),
        }
    }
}

impl PoolConfig {
    /// Upper bound on simultaneously registered workers
    pub fn capacity(&self) -> usize {
        self.size + self.max_overflow
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.size, "size", self.domain_name())?;
        validate_at_most(self.min_ready, self.size, "min_ready", self.domain_name())?;
        validate_positive(self.max_start_attempts, "max_start_attempts", self.domain_name())?;
        validate_duration(self.checkout_timeout, "checkout_timeout", self.domain_name())?;
        validate_duration(self.operation_timeout, "operation_timeout", self.domain_name())?;
        validate_duration(self.startup_timeout, "startup_timeout", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

fn default_size() -> usize {
    4
}

fn default_max_overflow() -> usize {
    2
}

fn default_min_ready() -> usize {
    1
}

fn default_checkout_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_start_attempts() -> u32 {
    3
}

fn default_start_retry_delay() -> Duration {
    Duration::from_millis(500)
}
