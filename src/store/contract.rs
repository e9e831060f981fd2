use super::models::{AggregateQuery, HistoryQuery, PersistedFlow, TrafficBucket};
use super::Result;
use crate::flow::AttributedFlow;

/// Append-only persistence for completed flows.
///
/// `save_completed` is idempotent per flow identifier: the store enforces
/// uniqueness on `flow_id` and ignores conflicting inserts, so replaying a
/// destroy event cannot double-count a flow.
pub trait FlowStore: Send + Sync + 'static {
    /// Persists a completed flow. Inserting the same `flow_id` twice leaves
    /// the store unchanged.
    fn save_completed(
        &self,
        flow: &AttributedFlow,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// True when a row with this flow identifier exists.
    fn has_flow(&self, flow_id: &str) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Returns one page of historical flows, newest first, together with the
    /// total number of matching rows.
    fn query_history(
        &self,
        query: &HistoryQuery,
    ) -> impl std::future::Future<Output = Result<(Vec<PersistedFlow>, u64)>> + Send;

    /// Returns traffic buckets for the requested interval, ordered
    /// descending by bucket start.
    fn aggregate(
        &self,
        query: &AggregateQuery,
    ) -> impl std::future::Future<Output = Result<Vec<TrafficBucket>>> + Send;

    /// Adds a pre-computed bucket onto its `(container, dest_ip, dest_port,
    /// interval_start)` key, summing counters on conflict.
    fn save_bucket(
        &self,
        container: &str,
        bucket: &TrafficBucket,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Deletes rows inserted more than `retention_days` days ago. Returns
    /// the number of rows removed.
    fn cleanup(&self, retention_days: u32) -> impl std::future::Future<Output = Result<u64>> + Send;
}
