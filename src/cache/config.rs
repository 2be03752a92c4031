//! Fragment cache and cascade configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MEMORY_LIMIT: usize = 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 0;
const DEFAULT_CASCADE_DEPTH: usize = 1;

/// Fragment cache configuration from `[cache]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every fragment renders without touching the backend.
    pub enabled: bool,
    /// Maximum fragments held by the in-memory backend.
    pub memory_limit: usize,
    /// Expiry applied when a fragment tag gives no timeout. Zero keeps entries
    /// until evicted.
    pub default_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            memory_limit: settings.memory_limit,
            default_timeout_secs: settings.default_timeout_secs,
        }
    }
}

impl CacheConfig {
    /// Returns the memory limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}

/// Invalidation cascade configuration from `[cascade]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Hops followed from a written entity. `1` touches direct dependents
    /// only; `0` disables cascading.
    pub max_depth: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_CASCADE_DEPTH,
        }
    }
}

impl From<&crate::config::CascadeSettings> for CascadeConfig {
    fn from(settings: &crate::config::CascadeSettings) -> Self {
        Self {
            max_depth: settings.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.memory_limit, 1024);
        assert_eq!(config.default_timeout(), None);
        assert_eq!(CascadeConfig::default().max_depth, 1);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_limit_non_zero().get(), 1);
    }

    #[test]
    fn default_timeout_in_seconds() {
        let config = CacheConfig {
            default_timeout_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(30)));
    }
}
