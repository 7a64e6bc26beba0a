//! Worker process launch configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How an external worker process is started and spoken to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerLaunchConfig {
    /// Executable to spawn
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments passed before the pool-worker arguments
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment variables for the worker process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory of the worker process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Time allowed for the startup probe to be echoed
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Time allowed for each termination phase
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Largest frame accepted from a worker
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for WorkerLaunchConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: BTreeMap::new(),
            working_dir: None,
            handshake_timeout: default_handshake_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Validatable for WorkerLaunchConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.command, "command", self.domain_name())?;
        validate_duration(self.handshake_timeout, "handshake_timeout", self.domain_name())?;
        validate_duration(self.shutdown_timeout, "shutdown_timeout", self.domain_name())?;
        validate_positive(self.max_frame_bytes, "max_frame_bytes", self.domain_name())?;

        if self.args.iter().any(|a| a == "--worker-id" || a == "--mode") {
            return Err(self.validation_error(
                "args must not contain --mode or --worker-id; they are appended by the pool",
            ));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}

fn default_command() -> String {
    "python3".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-u".to_string(), "priv/python/snakepit_bridge.py".to_string()]
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
