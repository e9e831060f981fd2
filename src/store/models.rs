use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySql, MySqlTypeInfo, MySqlValueRef};
use sqlx::{Decode, Type};

use super::error::Error;
use crate::flow::{Direction, Protocol, TcpState};

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: u64 = 100;
/// Hard cap on the history page size.
pub const MAX_HISTORY_LIMIT: u64 = 1_000;

impl Type<MySql> for Protocol {
    fn type_info() -> MySqlTypeInfo {
        <&str as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        <&str as Type<MySql>>::compatible(ty)
    }
}

impl<'r> Decode<'r, MySql> for Protocol {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as Decode<MySql>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

impl Type<MySql> for Direction {
    fn type_info() -> MySqlTypeInfo {
        <&str as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        <&str as Type<MySql>>::compatible(ty)
    }
}

impl<'r> Decode<'r, MySql> for Direction {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as Decode<MySql>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

impl Type<MySql> for TcpState {
    fn type_info() -> MySqlTypeInfo {
        <&str as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        <&str as Type<MySql>>::compatible(ty)
    }
}

impl<'r> Decode<'r, MySql> for TcpState {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as Decode<MySql>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

/// One completed flow as stored in the history table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersistedFlow {
    /// Surrogate primary key.
    pub id: u64,
    /// Source-assigned flow identifier; unique in the table.
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
    pub created_at: DateTime<Utc>,
}

/// Filters for a historical flow query.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub container: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub dest_ip: Option<IpAddr>,
    pub dest_port: Option<u16>,
    pub offset: u64,
    /// Page size; `None` means [`DEFAULT_HISTORY_LIMIT`], values above
    /// [`MAX_HISTORY_LIMIT`] are clamped.
    pub limit: Option<u64>,
}

impl HistoryQuery {
    pub fn effective_limit(&self) -> u64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT)
    }
}

/// Aggregation interval for time-bucketed traffic queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Minutes1,
    Minutes5,
    Minutes15,
    Minutes30,
    Hours1,
    Hours6,
    Hours12,
    Days1,
}

impl Interval {
    pub fn as_secs(self) -> i64 {
        match self {
            Interval::Minutes1 => 60,
            Interval::Minutes5 => 5 * 60,
            Interval::Minutes15 => 15 * 60,
            Interval::Minutes30 => 30 * 60,
            Interval::Hours1 => 3_600,
            Interval::Hours6 => 6 * 3_600,
            Interval::Hours12 => 12 * 3_600,
            Interval::Days1 => 24 * 3_600,
        }
    }

    /// True for intervals the hourly physical buckets cannot serve.
    pub fn is_finer_than_hour(self) -> bool {
        self.as_secs() < 3_600
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::Minutes1 => "1m",
            Interval::Minutes5 => "5m",
            Interval::Minutes15 => "15m",
            Interval::Minutes30 => "30m",
            Interval::Hours1 => "1h",
            Interval::Hours6 => "6h",
            Interval::Hours12 => "12h",
            Interval::Days1 => "1d",
        };
        f.write_str(s)
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::Minutes1),
            "5m" => Ok(Interval::Minutes5),
            "15m" => Ok(Interval::Minutes15),
            "30m" => Ok(Interval::Minutes30),
            "1h" => Ok(Interval::Hours1),
            "6h" => Ok(Interval::Hours6),
            "12h" => Ok(Interval::Hours12),
            "1d" => Ok(Interval::Days1),
            _ => Err(Error::UnsupportedInterval(s.to_owned())),
        }
    }
}

/// Parameters for a time-bucketed aggregation query.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub container: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Interval,
    pub group_by_dest_ip: bool,
    pub group_by_dest_port: bool,
}

/// One aggregation bucket: traffic totals for a container over an interval,
/// optionally split by destination.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrafficBucket {
    pub interval_start: DateTime<Utc>,
    pub dest_ip: Option<String>,
    pub dest_port: Option<u16>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_count: u64,
}

/// Recomposes hourly buckets into a coarser interval by summation.
///
/// Bucket starts are truncated onto interval boundaries; buckets sharing a
/// truncated start and destination key are summed. Output stays ordered
/// descending by bucket start. Intervals of one hour or less pass through
/// unchanged.
pub(crate) fn recompose_buckets(rows: Vec<TrafficBucket>, interval: Interval) -> Vec<TrafficBucket> {
    let secs = interval.as_secs();
    if secs <= 3_600 {
        return rows;
    }

    let mut merged: std::collections::BTreeMap<(i64, Option<String>, Option<u16>), TrafficBucket> =
        std::collections::BTreeMap::new();
    for row in rows {
        let ts = row.interval_start.timestamp();
        let start_ts = ts - ts.rem_euclid(secs);
        let start = DateTime::from_timestamp(start_ts, 0).unwrap_or(row.interval_start);

        merged
            .entry((start_ts, row.dest_ip.clone(), row.dest_port))
            .and_modify(|bucket| {
                bucket.bytes_sent += row.bytes_sent;
                bucket.bytes_received += row.bytes_received;
                bucket.connection_count += row.connection_count;
            })
            .or_insert(TrafficBucket {
                interval_start: start,
                ..row
            });
    }

    merged.into_values().rev().collect()
}
