//! Attribution: deciding which container a raw flow belongs to.
//!
//! The source endpoint is checked first, so a flow between two containers
//! on the same host is counted exactly once, as egress from the initiator.

use crate::directory::DirectoryCache;
use crate::flow::{AttributedFlow, Direction, FlowEvent};
use crate::inventory::InventoryProvider;

/// Joins a raw flow against the container directory.
///
/// Returns `None` when neither endpoint is a known container; such flows
/// are not tracked and produce no lifecycle events.
pub fn attribute<P: InventoryProvider>(
    event: &FlowEvent,
    directory: &DirectoryCache<P>,
) -> Option<AttributedFlow> {
    if let Some(name) = directory.lookup_by_ip(event.src_ip) {
        return Some(AttributedFlow::from_event(
            event,
            name,
            event.src_ip,
            Direction::Egress,
        ));
    }
    if let Some(name) = directory.lookup_by_ip(event.dst_ip) {
        return Some(AttributedFlow::from_event(
            event,
            name,
            event.dst_ip,
            Direction::Ingress,
        ));
    }
    None
}
