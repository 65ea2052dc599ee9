//! Manager tuning knobs.

use std::time::Duration;

use fleet_core::{DEFAULT_NAMESPACE, FleetConfig};
use fleet_runtime::CacheConfig;

/// Shortest period the reconciliation loop runs at. Shorter intervals,
/// including zero, are raised to this.
pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Namespace used when an operation leaves it empty.
    pub default_namespace: String,
    /// Period of the reconciliation loop (default: 30 seconds).
    pub reconcile_interval: Duration,
    /// Upper bound on concurrently running build and cleanup tasks.
    pub max_concurrent_tasks: usize,
    /// Attempts made to remove a deleted service's blobs.
    pub cleanup_retries: u32,
    /// Delay between cleanup attempts, multiplied by the attempt number.
    pub cleanup_backoff: Duration,
    /// Read cache placed in front of the execution backend.
    pub cache: CacheConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            reconcile_interval: Duration::from_secs(30),
            max_concurrent_tasks: 4,
            cleanup_retries: 3,
            cleanup_backoff: Duration::from_millis(500),
            cache: CacheConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// The reconcile period actually used, never below
    /// [`MIN_RECONCILE_INTERVAL`].
    pub fn effective_reconcile_interval(&self) -> Duration {
        self.reconcile_interval.max(MIN_RECONCILE_INTERVAL)
    }

    pub fn from_fleet(config: &FleetConfig) -> anyhow::Result<Self> {
        Ok(Self {
            default_namespace: config.manager.default_namespace.clone(),
            reconcile_interval: config.manager.reconcile_interval()?,
            max_concurrent_tasks: config.manager.max_concurrent_tasks,
            cleanup_retries: config.manager.cleanup_retries,
            cache: CacheConfig {
                ttl: config.runtime.cache_ttl()?,
                max_entries: config.runtime.cache_max_entries,
            },
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fleet_parses_durations() {
        let mut fleet = FleetConfig::default();
        fleet.manager.reconcile_interval = "2m".into();
        fleet.manager.default_namespace = "team-a".into();
        fleet.runtime.cache_ttl = "250ms".into();
        fleet.runtime.cache_max_entries = 8;

        let config = ManagerConfig::from_fleet(&fleet).unwrap();
        assert_eq!(config.default_namespace, "team-a");
        assert_eq!(config.reconcile_interval, Duration::from_secs(120));
        assert_eq!(config.cache.ttl, Duration::from_millis(250));
        assert_eq!(config.cache.max_entries, 8);
        assert_eq!(config.cleanup_retries, 3);
    }

    #[test]
    fn reconcile_interval_has_a_floor() {
        let mut config = ManagerConfig {
            reconcile_interval: Duration::ZERO,
            ..ManagerConfig::default()
        };
        assert_eq!(config.effective_reconcile_interval(), MIN_RECONCILE_INTERVAL);

        config.reconcile_interval = Duration::from_secs(45);
        assert_eq!(config.effective_reconcile_interval(), Duration::from_secs(45));
    }

    #[test]
    fn from_fleet_rejects_bad_durations() {
        let mut fleet = FleetConfig::default();
        fleet.manager.reconcile_interval = "soon".into();
        assert!(ManagerConfig::from_fleet(&fleet).is_err());
    }
}
