//! Collector configuration.

use std::time::Duration;

use crate::directory::DEFAULT_REFRESH_PERIOD;

/// Tunables for the traffic collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// CIDR of the container network, used for membership predicates.
    /// A malformed value is logged and membership checks return `false`.
    pub network_cidr: Option<String>,
    /// How often the full flow table is dumped to reconcile the registry.
    pub snapshot_interval: Duration,
    /// How often expired rows are deleted from the store.
    pub cleanup_interval: Duration,
    /// Age cutoff for store cleanup, in days.
    pub retention_days: u32,
    /// How often the container directory is refreshed.
    pub directory_refresh_interval: Duration,
    /// Concurrent persist tasks.
    pub persist_workers: usize,
    /// Database connection string; `None` disables persistence and the
    /// historical query endpoints.
    pub store_connection_string: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            network_cidr: Some("10.100.0.0/24".to_owned()),
            snapshot_interval: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 7,
            directory_refresh_interval: DEFAULT_REFRESH_PERIOD,
            persist_workers: 4,
            store_connection_string: None,
        }
    }
}

impl CollectorConfig {
    /// Builds a configuration from environment variables, falling back to
    /// the defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `NETWORK_CIDR`, `SNAPSHOT_INTERVAL_SECS`,
    /// `CLEANUP_INTERVAL_SECS`, `RETENTION_DAYS`,
    /// `DIRECTORY_REFRESH_SECS`, `DATABASE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(cidr) = std::env::var("NETWORK_CIDR") {
            config.network_cidr = Some(cidr);
        }
        if let Some(secs) = env_u64("SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(days) = env_u64("RETENTION_DAYS") {
            config.retention_days = days as u32;
        }
        if let Some(secs) = env_u64("DIRECTORY_REFRESH_SECS") {
            config.directory_refresh_interval = Duration::from_secs(secs);
        }
        config.store_connection_string = std::env::var("DATABASE_URL").ok();

        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparsable value `{raw}` for `{name}`");
            None
        }
    }
}
