//! In-memory index of currently active attributed flows.
//!
//! One exclusive writer (the collector's orchestrator) mutates the registry;
//! readers take shared access. The whole map lives under a single lock so
//! [`FlowRegistry::replace_all`] is atomic with respect to readers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{PoisonError, RwLock};

use crate::flow::AttributedFlow;

/// Active flows keyed by their source-assigned flow identifier.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, AttributedFlow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the flow under its identifier.
    ///
    /// When an entry already exists its `first_seen` is preserved; the rest
    /// of the entry is replaced by the newer observation.
    pub fn upsert(&self, mut flow: AttributedFlow) {
        let mut flows = self.write();
        match flows.entry(flow.id.clone()) {
            Entry::Occupied(mut entry) => {
                flow.first_seen = entry.get().first_seen;
                entry.insert(flow);
            }
            Entry::Vacant(entry) => {
                entry.insert(flow);
            }
        }
    }

    /// Removes and returns the entry for `id`, if present.
    pub fn remove(&self, id: &str) -> Option<AttributedFlow> {
        self.write().remove(id)
    }

    /// Replaces the full registry contents in one step.
    ///
    /// Used by snapshot reconciliation: readers see either the old or the
    /// new generation, never a mix.
    pub fn replace_all(&self, flows: HashMap<String, AttributedFlow>) {
        *self.write() = flows;
    }

    /// Returns the active flows, optionally restricted to one container.
    pub fn snapshot_filtered(&self, container: Option<&str>) -> Vec<AttributedFlow> {
        self.read()
            .values()
            .filter(|flow| container.is_none_or(|name| flow.container_name == name))
            .cloned()
            .collect()
    }

    /// Number of active flows.
    pub fn size(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AttributedFlow>> {
        self.flows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AttributedFlow>> {
        self.flows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::flow::{Direction, Protocol};

    fn flow(id: &str, container: &str) -> AttributedFlow {
        AttributedFlow {
            id: id.to_owned(),
            container_name: container.to_owned(),
            container_ip: "10.0.0.5".parse().unwrap(),
            protocol: Protocol::Tcp,
            source_ip: "10.0.0.5".parse().unwrap(),
            source_port: 40000,
            dest_ip: "93.184.216.34".parse().unwrap(),
            dest_port: 443,
            tcp_state: None,
            direction: Direction::Egress,
            bytes_sent: 100,
            bytes_received: 200,
            packets_sent: 1,
            packets_received: 2,
            timeout_seconds: 120,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_size() {
        let registry = FlowRegistry::new();
        registry.upsert(flow("1", "a"));
        registry.upsert(flow("2", "a"));
        registry.upsert(flow("2", "a"));
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn test_upsert_preserves_first_seen() {
        let registry = FlowRegistry::new();
        let first = flow("1", "a");
        let first_seen = first.first_seen;
        registry.upsert(first);

        let mut update = flow("1", "a");
        update.first_seen = first_seen + Duration::seconds(30);
        update.last_seen = first_seen + Duration::seconds(30);
        update.bytes_sent = 500;
        registry.upsert(update);

        let flows = registry.snapshot_filtered(Some("a"));
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].first_seen, first_seen);
        assert_eq!(flows[0].last_seen, first_seen + Duration::seconds(30));
        assert_eq!(flows[0].bytes_sent, 500);
    }

    #[test]
    fn test_remove_returns_prior_entry() {
        let registry = FlowRegistry::new();
        registry.upsert(flow("1", "a"));

        let removed = registry.remove("1");
        assert_eq!(removed.map(|f| f.id), Some("1".to_owned()));
        assert_eq!(registry.size(), 0);
        assert!(registry.remove("1").is_none());
    }

    #[test]
    fn test_replace_all_swaps_contents() {
        let registry = FlowRegistry::new();
        registry.upsert(flow("3", "c"));

        let mut next = HashMap::new();
        next.insert("4".to_owned(), flow("4", "c"));
        registry.replace_all(next);

        let flows = registry.snapshot_filtered(None);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id, "4");
    }

    #[test]
    fn test_snapshot_filtered_by_container() {
        let registry = FlowRegistry::new();
        registry.upsert(flow("1", "a"));
        registry.upsert(flow("2", "b"));

        assert_eq!(registry.snapshot_filtered(Some("a")).len(), 1);
        assert_eq!(registry.snapshot_filtered(Some("z")).len(), 0);
        assert_eq!(registry.snapshot_filtered(None).len(), 2);
    }
}
