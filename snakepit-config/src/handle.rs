//! Shared, runtime-updatable configuration handle
//!
//! Components hold a [`ConfigHandle`] instead of a copied config so that
//! timeouts and TTLs are read at the moment they are applied. Updates are
//! validated before they become visible; a rejected update leaves the
//! previous values in place.

use crate::domains::SnakepitConfig;
use crate::error::ConfigResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// Cloneable handle to the live configuration
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<SnakepitConfig>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration, validating it first
    pub fn new(config: SnakepitConfig) -> ConfigResult<Self> {
        config.validate_all()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> SnakepitConfig {
        self.inner.read().clone()
    }

    /// Read a single value without cloning the whole configuration
    pub fn read<R>(&self, f: impl FnOnce(&SnakepitConfig) -> R) -> R {
        f(&self.inner.read())
    }

    /// Apply a modification; committed only if the result validates
    pub fn update(&self, f: impl FnOnce(&mut SnakepitConfig)) -> ConfigResult<()> {
        let mut guard = self.inner.write();
        let mut candidate = guard.clone();
        f(&mut candidate);
        candidate.validate_all()?;
        log::debug!("configuration updated");
        *guard = candidate;
        Ok(())
    }

    /// Replace the configuration wholesale
    pub fn replace(&self, config: SnakepitConfig) -> ConfigResult<()> {
        config.validate_all()?;
        *self.inner.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_update_is_visible_to_clones() {
        let handle = ConfigHandle::new(SnakepitConfig::default()).unwrap();
        let other = handle.clone();

        handle
            .update(|c| c.affinity.ttl = Duration::from_millis(200))
            .unwrap();

        assert_eq!(other.read(|c| c.affinity.ttl), Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let handle = ConfigHandle::new(SnakepitConfig::default()).unwrap();
        let before = handle.current();

        assert!(handle.update(|c| c.pool.size = 0).is_err());
        assert_eq!(handle.current(), before);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = SnakepitConfig::default();
        config.worker.command = String::new();
        assert!(ConfigHandle::new(config).is_err());
    }
}
