//! Logging initialisation for Snakepit
//!
//! Installs a global `tracing` subscriber driven by [`LoggingConfig`].
//! Libraries in the workspace that emit through the `log` facade are
//! captured as well, since the fmt subscriber bridges `log` records.
//!
//! Output goes to stderr: a worker's stdout carries protocol frames.

use anyhow::{Context, Result};
use snakepit_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Initialize logging from configuration
///
/// `RUST_LOG` is ignored here; the configured directives are authoritative.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let directives = config.filter_directives();
    let env_filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter {:?}", directives))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    // Use try_init to avoid panic if global subscriber already set
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_filter(log_level, false);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize logging for tests; output is captured by the test harness
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter("debug", true))
        .with_test_writer()
        .try_init();
}

fn build_filter(level: &str, prefer_env: bool) -> EnvFilter {
    if prefer_env {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
