use chrono::{DateTime, Utc};
use std::net::IpAddr;

use crate::flow::{AttributedFlow, Direction, Protocol, TcpState};
use crate::store::{PersistedFlow, TrafficBucket};

/// Active-connection filters, applied after snapshot materialization.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ConnectionsParams {
    pub container: Option<String>,
    pub protocol: Option<String>,
    pub dest_ip_prefix: Option<String>,
    pub dest_port: Option<u16>,
    pub limit: Option<usize>,
}

const DEFAULT_CONNECTIONS_LIMIT: usize = 100;

#[derive(Debug, serde::Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<AttributedFlow>,
    pub total_count: u64,
}

#[derive(Debug, serde::Deserialize)]
pub struct SummaryParams {
    pub container: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct HistoryParams {
    pub container: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub dest_ip: Option<IpAddr>,
    pub dest_port: Option<u16>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, serde::Serialize)]
pub struct HistoryResponse {
    pub rows: Vec<HistoricalFlow>,
    pub total_count: u64,
}

/// One persisted flow as returned by the history endpoint.
#[derive(Debug, serde::Serialize)]
pub struct HistoricalFlow {
    pub id: u64,
    pub flow_id: String,
    pub container_name: String,
    pub container_ip: String,
    pub protocol: Protocol,
    pub source_ip: String,
    pub source_port: Option<u16>,
    pub dest_ip: String,
    pub dest_port: Option<u16>,
    pub tcp_state: Option<TcpState>,
    pub direction: Direction,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl From<PersistedFlow> for HistoricalFlow {
    fn from(row: PersistedFlow) -> Self {
        Self {
            id: row.id,
            flow_id: row.flow_id,
            container_name: row.container_name,
            container_ip: row.container_ip,
            protocol: row.protocol,
            source_ip: row.source_ip,
            source_port: row.source_port,
            dest_ip: row.dest_ip,
            dest_port: row.dest_port,
            tcp_state: row.tcp_state,
            direction: row.direction,
            bytes_sent: row.bytes_sent,
            bytes_received: row.bytes_received,
            packets_sent: row.packets_sent,
            packets_received: row.packets_received,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct AggregatesParams {
    pub container: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Option<String>,
    pub group_by_dest_ip: Option<bool>,
    pub group_by_dest_port: Option<bool>,
}

#[derive(Debug, serde::Serialize)]
pub struct AggregatesResponse {
    pub buckets: Vec<TrafficBucket>,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusResponse {
    pub available: bool,
    pub error: Option<String>,
}

/// Filters the materialized flow list and applies the page limit.
///
/// Returns the page together with the total number of flows matching the
/// filters before the limit was applied.
pub fn apply_connection_filters(
    flows: Vec<AttributedFlow>,
    protocol: Option<Protocol>,
    params: &ConnectionsParams,
) -> (Vec<AttributedFlow>, u64) {
    let mut filtered: Vec<AttributedFlow> = flows
        .into_iter()
        .filter(|flow| protocol.is_none_or(|p| flow.protocol == p))
        .filter(|flow| {
            params
                .dest_ip_prefix
                .as_deref()
                .is_none_or(|prefix| flow.dest_ip.to_string().starts_with(prefix))
        })
        .filter(|flow| params.dest_port.is_none_or(|port| flow.dest_port == port))
        .collect();

    let total_count = filtered.len() as u64;
    filtered.truncate(params.limit.unwrap_or(DEFAULT_CONNECTIONS_LIMIT));

    (filtered, total_count)
}
