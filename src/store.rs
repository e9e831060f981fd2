//! Durable flow persistence: append-only history of completed flows,
//! historical queries, and time-bucketed aggregation.

mod contract;
mod error;
mod models;
mod mysql;

pub use contract::FlowStore;
pub use error::{Error, Result};
pub use models::{
    AggregateQuery, DEFAULT_HISTORY_LIMIT, HistoryQuery, Interval, MAX_HISTORY_LIMIT,
    PersistedFlow, TrafficBucket,
};
pub use mysql::MySqlFlowStore;
