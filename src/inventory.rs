//! Container inventory contract: who owns which IP address.
//!
//! An [`InventoryProvider`] enumerates the containers on this host together
//! with their network addresses. The directory cache polls it on a fixed
//! cadence; providers are expected to return a full snapshot on every call.

use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to list containers: {0}")]
    List(String),
    #[error("invalid container table entry `{0}`, expected `name=ip`")]
    InvalidEntry(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A container name and the IP address of its network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAddress {
    pub name: String,
    pub ip: IpAddr,
}

/// Enumerates `{container name -> IP}` snapshots.
pub trait InventoryProvider: Send + Sync + 'static {
    /// Returns the full current container list.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<ContainerAddress>>> + Send;
}

/// A fixed container table, parsed from `name=ip[,name=ip...]`.
///
/// Useful for standalone deployments where the container addresses are
/// statically assigned and no runtime inventory service is reachable.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    entries: Vec<ContainerAddress>,
}

impl FromStr for StaticProvider {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, ip) = part
                .split_once('=')
                .ok_or_else(|| Error::InvalidEntry(part.to_owned()))?;
            let ip = ip
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidEntry(part.to_owned()))?;
            entries.push(ContainerAddress {
                name: name.trim().to_owned(),
                ip,
            });
        }
        Ok(Self { entries })
    }
}

impl InventoryProvider for StaticProvider {
    async fn list(&self) -> Result<Vec<ContainerAddress>> {
        Ok(self.entries.clone())
    }
}
