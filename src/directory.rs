//! Directory cache mapping container IP addresses to names and back.
//!
//! The cache is refreshed from an [`InventoryProvider`] on a fixed cadence.
//! Each refresh rebuilds both maps aside and swaps them in under a single
//! write lock, so readers always observe one complete generation. A failed
//! refresh leaves the previous generation intact.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use ipnet::IpNet;
use tokio_util::sync::CancellationToken;

use crate::inventory::{self, InventoryProvider};

/// How often the background refresher polls the inventory provider.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Maps {
    ip_to_name: HashMap<IpAddr, String>,
    name_to_ip: HashMap<String, IpAddr>,
}

/// Thread-safe bidirectional IP<->name map for one host's containers.
#[derive(Debug)]
pub struct DirectoryCache<P> {
    provider: P,
    network: Option<IpNet>,
    maps: RwLock<Maps>,
}

impl<P: InventoryProvider> DirectoryCache<P> {
    /// Creates an empty cache over `provider`.
    ///
    /// The container network CIDR is parsed once; a malformed CIDR is logged
    /// and membership checks then return `false` for all inputs. The cache
    /// starts empty and serves once the first refresh succeeds.
    pub fn new(provider: P, network_cidr: Option<&str>) -> Self {
        let network = network_cidr.and_then(|cidr| match IpNet::from_str(cidr) {
            Ok(net) => Some(net),
            Err(err) => {
                log::warn!("failed to parse network CIDR `{cidr}`: {err}");
                None
            }
        });

        Self {
            provider,
            network,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Returns the container name owning `ip`, if any.
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.read().ip_to_name.get(&ip).cloned()
    }

    /// Returns the IP address of container `name`, if known.
    pub fn lookup_by_name(&self, name: &str) -> Option<IpAddr> {
        self.read().name_to_ip.get(name).copied()
    }

    /// True when `ip` falls inside the configured container network.
    ///
    /// Always `false` when no network CIDR is configured.
    pub fn is_in_network(&self, ip: IpAddr) -> bool {
        self.network.is_some_and(|net| net.contains(&ip))
    }

    /// Returns a copy of the full `name -> ip` map.
    pub fn snapshot(&self) -> HashMap<String, IpAddr> {
        self.read().name_to_ip.clone()
    }

    /// Number of containers in the current generation.
    pub fn size(&self) -> usize {
        self.read().name_to_ip.len()
    }

    /// Fetches a fresh container list and atomically replaces both maps.
    ///
    /// On provider failure the previous generation stays in place.
    pub async fn refresh(&self) -> inventory::Result<()> {
        let containers = self.provider.list().await?;

        let mut next = Maps {
            ip_to_name: HashMap::with_capacity(containers.len()),
            name_to_ip: HashMap::with_capacity(containers.len()),
        };
        for container in containers {
            next.ip_to_name.insert(container.ip, container.name.clone());
            next.name_to_ip.insert(container.name, container.ip);
        }

        let size = next.name_to_ip.len();
        *self
            .maps
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        log::debug!("container directory refreshed: {size} containers");

        Ok(())
    }

    /// Runs the periodic refresh loop until `cancel` fires.
    ///
    /// Performs an initial refresh immediately; refresh failures are logged
    /// and the loop continues.
    pub async fn run_refresh(&self, period: Duration, cancel: CancellationToken) {
        if let Err(err) = self.refresh().await {
            log::warn!("initial container directory refresh failed: {err}");
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        log::warn!("container directory refresh failed: {err}");
                    }
                }
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::inventory::{ContainerAddress, Error};

    /// Serves a scripted sequence of `list()` results.
    struct ScriptedProvider {
        responses: Mutex<Vec<inventory::Result<Vec<ContainerAddress>>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<inventory::Result<Vec<ContainerAddress>>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    impl InventoryProvider for ScriptedProvider {
        async fn list(&self) -> inventory::Result<Vec<ContainerAddress>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(Vec::new());
            }
            responses.remove(0)
        }
    }

    fn addr(name: &str, ip: &str) -> ContainerAddress {
        ContainerAddress {
            name: name.to_owned(),
            ip: ip.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_both_maps() {
        let provider =
            ScriptedProvider::new(vec![Ok(vec![addr("a", "10.0.0.5"), addr("b", "10.0.0.6")])]);
        let cache = DirectoryCache::new(provider, Some("10.0.0.0/24"));

        cache.refresh().await.unwrap();

        assert_eq!(cache.size(), 2);
        assert_eq!(
            cache.lookup_by_ip("10.0.0.5".parse().unwrap()),
            Some("a".to_owned())
        );
        assert_eq!(
            cache.lookup_by_name("b"),
            Some("10.0.0.6".parse().unwrap())
        );
        assert_eq!(cache.lookup_by_ip("10.0.0.99".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_generation() {
        let provider = ScriptedProvider::new(vec![
            Ok(vec![addr("a", "10.0.0.5")]),
            Err(Error::List("inventory down".to_owned())),
        ]);
        let cache = DirectoryCache::new(provider, None);

        cache.refresh().await.unwrap();
        assert!(cache.refresh().await.is_err());

        assert_eq!(
            cache.lookup_by_ip("10.0.0.5".parse().unwrap()),
            Some("a".to_owned())
        );
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn test_refresh_replaces_stale_entries() {
        let provider = ScriptedProvider::new(vec![
            Ok(vec![addr("a", "10.0.0.5")]),
            Ok(vec![addr("a", "10.0.0.7")]),
        ]);
        let cache = DirectoryCache::new(provider, None);

        cache.refresh().await.unwrap();
        cache.refresh().await.unwrap();

        assert_eq!(cache.lookup_by_ip("10.0.0.5".parse().unwrap()), None);
        assert_eq!(
            cache.lookup_by_ip("10.0.0.7".parse().unwrap()),
            Some("a".to_owned())
        );
    }

    #[test]
    fn test_is_in_network() {
        let provider = ScriptedProvider::new(vec![]);
        let cache = DirectoryCache::new(provider, Some("10.100.0.0/24"));

        assert!(cache.is_in_network("10.100.0.17".parse().unwrap()));
        assert!(!cache.is_in_network("10.200.0.17".parse().unwrap()));
    }

    #[test]
    fn test_no_network_configured_means_no_membership() {
        let provider = ScriptedProvider::new(vec![]);
        let cache = DirectoryCache::new(provider, None);
        assert!(!cache.is_in_network("10.100.0.17".parse().unwrap()));
    }

    #[test]
    fn test_malformed_cidr_means_no_membership() {
        let provider = ScriptedProvider::new(vec![]);
        let cache = DirectoryCache::new(provider, Some("not-a-cidr"));
        assert!(!cache.is_in_network("10.100.0.17".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_snapshot_is_a_defensive_copy() {
        let provider = ScriptedProvider::new(vec![Ok(vec![addr("a", "10.0.0.5")])]);
        let cache = DirectoryCache::new(provider, None);
        cache.refresh().await.unwrap();

        let mut snapshot = cache.snapshot();
        snapshot.remove("a");

        assert_eq!(cache.size(), 1);
    }
}
