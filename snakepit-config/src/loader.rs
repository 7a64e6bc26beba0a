//! Configuration loading and environment variable handling

use crate::domains::SnakepitConfig;
use crate::error::{ConfigError, ConfigResult};
use log::debug;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "SNAKEPIT".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a file with environment overrides.
    ///
    /// Files ending in `.json` are parsed as JSON, anything else as YAML.
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<SnakepitConfig> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config: SnakepitConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        debug!("Loaded configuration from {}", path.display());

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<SnakepitConfig> {
        let mut config = SnakepitConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<SnakepitConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut SnakepitConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_worker_overrides(&mut config.worker)?;
        self.apply_affinity_overrides(&mut config.affinity)?;
        self.apply_circuit_breaker_overrides(&mut config.circuit_breaker)?;
        self.apply_health_overrides(&mut config.health)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_pool_overrides(
        &self,
        config: &mut crate::domains::pool::PoolConfig,
    ) -> ConfigResult<()> {
        if let Some(size) = self.parse_env("POOL_SIZE")? {
            config.size = size;
        }
        if let Some(overflow) = self.parse_env("POOL_MAX_OVERFLOW")? {
            config.max_overflow = overflow;
        }
        if let Some(min_ready) = self.parse_env("POOL_MIN_READY")? {
            config.min_ready = min_ready;
        }
        if let Some(timeout) = self.millis_env("CHECKOUT_TIMEOUT_MS")? {
            config.checkout_timeout = timeout;
        }
        if let Some(timeout) = self.millis_env("OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = timeout;
        }
        if let Some(timeout) = self.millis_env("STARTUP_TIMEOUT_MS")? {
            config.startup_timeout = timeout;
        }
        if let Some(attempts) = self.parse_env("MAX_START_ATTEMPTS")? {
            config.max_start_attempts = attempts;
        }
        Ok(())
    }

    fn apply_worker_overrides(
        &self,
        config: &mut crate::domains::worker::WorkerLaunchConfig,
    ) -> ConfigResult<()> {
        if let Ok(command) = self.get_env_var("WORKER_COMMAND") {
            config.command = command;
        }
        if let Ok(args) = self.get_env_var("WORKER_ARGS") {
            config.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(dir) = self.get_env_var("WORKER_DIR") {
            config.working_dir = Some(dir.into());
        }
        if let Some(timeout) = self.millis_env("HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = timeout;
        }
        if let Some(timeout) = self.millis_env("SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }
        Ok(())
    }

    fn apply_affinity_overrides(
        &self,
        config: &mut crate::domains::affinity::AffinityConfig,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_env("AFFINITY_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(ttl) = self.millis_env("AFFINITY_TTL_MS")? {
            config.ttl = ttl;
        }
        Ok(())
    }

    fn apply_circuit_breaker_overrides(
        &self,
        config: &mut crate::domains::circuit_breaker::CircuitBreakerSettings,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_env("CIRCUIT_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(threshold) = self.parse_env("CIRCUIT_FAILURE_THRESHOLD")? {
            config.failure_threshold = threshold;
        }
        if let Some(cooldown) = self.millis_env("CIRCUIT_COOLDOWN_MS")? {
            config.cooldown = cooldown;
        }
        Ok(())
    }

    fn apply_health_overrides(
        &self,
        config: &mut crate::domains::health::HealthConfig,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_env("HEALTH_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(interval) = self.millis_env("HEALTH_INTERVAL_MS")? {
            config.interval = interval;
        }
        Ok(())
    }

    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        if let Ok(directives) = self.get_env_var("LOG_DIRECTIVES") {
            config.directives = directives
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(())
    }

    fn parse_env<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))),
            Err(_) => Ok(None),
        }
    }

    fn millis_env(&self, name: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse_env::<u64>(name)?.map(Duration::from_millis))
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_override_pool_size() {
        temp_env::with_vars(
            [
                ("SNAKEPIT_POOL_SIZE", Some("7")),
                ("SNAKEPIT_AFFINITY_TTL_MS", Some("200")),
            ],
            || {
                let config = ConfigLoader::new().from_env().unwrap();
                assert_eq!(config.pool.size, 7);
                assert_eq!(config.affinity.ttl, Duration::from_millis(200));
            },
        );
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        temp_env::with_var("SNAKEPIT_POOL_SIZE", Some("many"), || {
            let err = ConfigLoader::new().from_env().unwrap_err();
            assert!(err.to_string().contains("SNAKEPIT_POOL_SIZE"));
        });
    }

    #[test]
    fn test_custom_prefix() {
        temp_env::with_var("PIT_LOG_LEVEL", Some("debug"), || {
            let config = ConfigLoader::with_prefix("PIT").from_env().unwrap();
            assert_eq!(config.logging.level, crate::LogLevel::Debug);
        });
    }
}
