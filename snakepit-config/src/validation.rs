//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a non-zero duration
pub fn validate_duration(value: Duration, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be a non-zero duration", field_name),
        });
    }
    Ok(())
}

/// Validate that `value` does not exceed `max`
pub fn validate_at_most<T>(value: T, max: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value > max {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be at most {}, got {}", field_name, max, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_required_string() {
        assert!(validate_required_string("python3", "command", "worker").is_ok());
        assert!(validate_required_string("", "command", "worker").is_err());
        assert!(validate_required_string("   ", "command", "worker").is_err());
    }

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1usize, "size", "pool").is_ok());
        assert!(validate_positive(0usize, "size", "pool").is_err());
    }

    #[test]
    fn test_validate_duration() {
        assert!(validate_duration(Duration::from_millis(1), "ttl", "affinity").is_ok());
        let err = validate_duration(Duration::ZERO, "ttl", "affinity").unwrap_err();
        assert!(err.to_string().contains("affinity"));
        assert!(err.to_string().contains("ttl"));
    }

    #[test]
    fn test_validate_at_most() {
        assert!(validate_at_most(2usize, 4, "min_ready", "pool").is_ok());
        assert!(validate_at_most(5usize, 4, "min_ready", "pool").is_err());
    }
}
