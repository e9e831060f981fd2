use tokio::sync::mpsc;

use super::{Error, FlowSource, Result};
use crate::flow::FlowEvent;

/// Opens the platform flow source.
///
/// No kernel conntrack backend is bundled with this crate; deployments wire
/// one in by implementing [`FlowSource`] over their platform's netlink
/// facility. Until then every platform reports [`Error::Unsupported`] and
/// the collector runs degraded: historical queries keep working, live reads
/// return empty results.
pub fn open() -> Result<PlatformSource> {
    Err(Error::Unsupported)
}

/// Placeholder source type for platforms without a conntrack backend.
///
/// Uninhabited: [`open`] never constructs one.
#[derive(Debug)]
pub enum PlatformSource {}

impl FlowSource for PlatformSource {
    fn events(&self) -> Option<mpsc::Receiver<FlowEvent>> {
        match *self {}
    }

    async fn snapshot(&self) -> Result<Vec<FlowEvent>> {
        match *self {}
    }

    fn close(&self) {
        match *self {}
    }
}
