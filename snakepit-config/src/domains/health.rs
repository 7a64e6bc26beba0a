//! Health monitor configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether idle workers are probed periodically
    #[serde(default = "crate::domains::utils::default_true")]
    pub enabled: bool,

    /// Time between probe rounds
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Only workers idle for longer than this are probed
    #[serde(with = "humantime_serde", default = "default_idle_threshold")]
    pub idle_threshold: Duration,

    /// Consecutive probe failures that make a worker unhealthy
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,

    /// Deadline for a single probe
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            idle_threshold: default_idle_threshold(),
            max_probe_failures: default_max_probe_failures(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl Validatable for HealthConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.interval, "interval", self.domain_name())?;
        validate_duration(self.probe_timeout, "probe_timeout", self.domain_name())?;
        validate_positive(self.max_probe_failures, "max_probe_failures", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "health"
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_max_probe_failures() -> u32 {
    2
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}
