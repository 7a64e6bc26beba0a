//! Session affinity configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session affinity configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AffinityConfig {
    /// Whether sessions prefer the worker they last used
    #[serde(default = "crate::domains::utils::default_true")]
    pub enabled: bool,

    /// Idle time after which a session forgets its worker
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,

    /// How often expired entries are purged in the background
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Validatable for AffinityConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.ttl, "ttl", self.domain_name())?;
        validate_duration(self.sweep_interval, "sweep_interval", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "affinity"
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
