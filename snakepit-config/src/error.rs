//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON config: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A `SNAKEPIT_*` override that does not parse
    #[error("Environment variable error: {0}")]
    EnvError(String),

    /// A value rejected by a domain's validation, at load or on a live update
    #[error("Invalid {domain} configuration: {message}")]
    DomainError { domain: String, message: String },
}

impl ConfigError {
    /// Domain that rejected the value, if this is a validation error
    pub fn domain(&self) -> Option<&str> {
        match self {
            ConfigError::DomainError { domain, .. } => Some(domain),
            _ => None,
        }
    }
}
