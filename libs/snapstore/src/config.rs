//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::RetryPolicy;

/// Template store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding per-template local state.
    pub cache_root: PathBuf,

    /// Cache entry lifetime, refreshed on access. Kept longer than the
    /// maximum sandbox lifetime so a running sandbox never loses its
    /// template mid-flight.
    pub template_ttl: Duration,

    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,

    /// Serve mock templates instead of storage-backed ones.
    pub mock_templates: bool,

    /// Retry schedule for blob store operations.
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/lib/sandpool/templates"),
            template_ttl: Duration::from_secs(25 * 60 * 60), // 25 hours
            sweep_interval: Duration::from_secs(60),
            mock_templates: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_root = std::env::var("SANDPOOL_CACHE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_root);

        let template_ttl = std::env::var("SANDPOOL_TEMPLATE_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|hours| Duration::from_secs(hours * 60 * 60))
            .unwrap_or(defaults.template_ttl);

        let sweep_interval = std::env::var("SANDPOOL_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let mock_templates = std::env::var("SANDPOOL_MOCK_TEMPLATES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        Self {
            cache_root,
            template_ttl,
            sweep_interval,
            mock_templates,
            retry: defaults.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.template_ttl, Duration::from_secs(90_000));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert!(!config.mock_templates);
    }
}
