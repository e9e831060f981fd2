use chrono::{DateTime, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::{QueryBuilder, Row};

use super::contract::FlowStore;
use super::models::{AggregateQuery, HistoryQuery, PersistedFlow, TrafficBucket, recompose_buckets};
use super::{Error, Result};
use crate::flow::AttributedFlow;

/// MySQL-backed flow store.
#[derive(Debug, Clone)]
pub struct MySqlFlowStore {
    db: MySqlPool,
}

impl MySqlFlowStore {
    /// Connects to the database and applies pending migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = MySqlPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(10))
            .max_connections(10)
            .connect(url)
            .await
            .map_err(Error::Connection)?;

        sqlx::migrate!().run(&db).await.map_err(Error::Migration)?;

        Ok(Self { db })
    }

    /// Wraps an existing pool; migrations are the caller's responsibility.
    pub fn new(db: MySqlPool) -> Self {
        Self { db }
    }
}

fn push_history_filters<'a>(builder: &mut QueryBuilder<'a, MySql>, query: &'a HistoryQuery) {
    builder.push(" WHERE container_name = ");
    builder.push_bind(&query.container);
    builder.push(" AND started_at >= ");
    builder.push_bind(query.start);
    builder.push(" AND started_at <= ");
    builder.push_bind(query.end);
    if let Some(dest_ip) = query.dest_ip {
        builder.push(" AND dest_ip = ");
        builder.push_bind(dest_ip.to_string());
    }
    if let Some(dest_port) = query.dest_port {
        builder.push(" AND dest_port = ");
        builder.push_bind(dest_port);
    }
}

impl FlowStore for MySqlFlowStore {
    /// Inserts a completed flow, relying on the unique `flow_id` index to
    /// silently ignore replays of the same flow.
    async fn save_completed(&self, flow: &AttributedFlow) -> Result<()> {
        const INSERT_QUERY: &str = r#"
INSERT IGNORE INTO traffic_flows (
    flow_id, container_name, container_ip, protocol,
    source_ip, source_port, dest_ip, dest_port,
    tcp_state, direction,
    bytes_sent, bytes_received, packets_sent, packets_received,
    started_at, ended_at, duration_seconds
) VALUES (
    ?, ?, ?, ?,
    ?, ?, ?, ?,
    ?, ?,
    ?, ?, ?, ?,
    ?, ?, ?
)
"#;

        let has_ports = matches!(
            flow.protocol,
            crate::flow::Protocol::Tcp | crate::flow::Protocol::Udp
        );
        let duration_seconds = (flow.last_seen - flow.first_seen).num_seconds();

        sqlx::query(INSERT_QUERY)
            .bind(&flow.id)
            .bind(&flow.container_name)
            .bind(flow.container_ip.to_string())
            .bind(flow.protocol.to_string())
            .bind(flow.source_ip.to_string())
            .bind(has_ports.then_some(flow.source_port))
            .bind(flow.dest_ip.to_string())
            .bind(has_ports.then_some(flow.dest_port))
            .bind(flow.tcp_state.map(|state| state.to_string()))
            .bind(flow.direction.to_string())
            .bind(flow.bytes_sent)
            .bind(flow.bytes_received)
            .bind(flow.packets_sent)
            .bind(flow.packets_received)
            .bind(flow.first_seen)
            .bind(flow.last_seen)
            .bind(duration_seconds)
            .execute(&self.db)
            .await
            .map_err(Error::Insert)?;

        Ok(())
    }

    async fn has_flow(&self, flow_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM traffic_flows WHERE flow_id = ? LIMIT 1")
            .bind(flow_id)
            .fetch_optional(&self.db)
            .await
            .map_err(Error::Read)?;

        Ok(row.is_some())
    }

    async fn query_history(&self, query: &HistoryQuery) -> Result<(Vec<PersistedFlow>, u64)> {
        let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM traffic_flows");
        push_history_filters(&mut count_query, query);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.db)
            .await
            .map_err(Error::Read)?;

        let mut select_query = QueryBuilder::new("SELECT * FROM traffic_flows");
        push_history_filters(&mut select_query, query);
        select_query.push(" ORDER BY started_at DESC LIMIT ");
        select_query.push_bind(query.effective_limit());
        select_query.push(" OFFSET ");
        select_query.push_bind(query.offset);

        let rows = select_query
            .build_query_as::<PersistedFlow>()
            .fetch_all(&self.db)
            .await
            .map_err(Error::Read)?;

        Ok((rows, total as u64))
    }

    /// Aggregates over hourly physical buckets, recomposing coarser
    /// intervals in memory. Sub-hourly intervals are rejected.
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<TrafficBucket>> {
        if query.interval.is_finer_than_hour() {
            return Err(Error::IntervalTooFine(query.interval));
        }

        let mut builder = QueryBuilder::<MySql>::new(
            "SELECT FROM_UNIXTIME(FLOOR(UNIX_TIMESTAMP(started_at) / 3600) * 3600) AS bucket_start",
        );
        if query.group_by_dest_ip {
            builder.push(", dest_ip");
        }
        if query.group_by_dest_port {
            builder.push(", dest_port");
        }
        builder.push(
            ", CAST(COALESCE(SUM(bytes_sent), 0) AS UNSIGNED) AS bytes_sent, \
             CAST(COALESCE(SUM(bytes_received), 0) AS UNSIGNED) AS bytes_received, \
             CAST(COUNT(*) AS UNSIGNED) AS connection_count \
             FROM traffic_flows",
        );
        builder.push(" WHERE container_name = ");
        builder.push_bind(&query.container);
        builder.push(" AND started_at >= ");
        builder.push_bind(query.start);
        builder.push(" AND started_at <= ");
        builder.push_bind(query.end);
        builder.push(" GROUP BY bucket_start");
        if query.group_by_dest_ip {
            builder.push(", dest_ip");
        }
        if query.group_by_dest_port {
            builder.push(", dest_port");
        }
        builder.push(" ORDER BY bucket_start DESC");

        let rows = builder
            .build()
            .fetch_all(&self.db)
            .await
            .map_err(Error::Read)?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let interval_start: DateTime<Utc> =
                row.try_get("bucket_start").map_err(Error::Read)?;
            let dest_ip = if query.group_by_dest_ip {
                row.try_get("dest_ip").map_err(Error::Read)?
            } else {
                None
            };
            let dest_port = if query.group_by_dest_port {
                row.try_get("dest_port").map_err(Error::Read)?
            } else {
                None
            };

            buckets.push(TrafficBucket {
                interval_start,
                dest_ip,
                dest_port,
                bytes_sent: row.try_get("bytes_sent").map_err(Error::Read)?,
                bytes_received: row.try_get("bytes_received").map_err(Error::Read)?,
                connection_count: row.try_get("connection_count").map_err(Error::Read)?,
            });
        }

        Ok(recompose_buckets(buckets, query.interval))
    }

    async fn save_bucket(&self, container: &str, bucket: &TrafficBucket) -> Result<()> {
        const UPSERT_QUERY: &str = r#"
INSERT INTO traffic_aggregates (
    container_name, dest_ip, dest_port, interval_start,
    bytes_sent, bytes_received, connection_count
) VALUES (
    ?, ?, ?, ?,
    ?, ?, ?
)
ON DUPLICATE KEY UPDATE
    bytes_sent = bytes_sent + VALUES(bytes_sent),
    bytes_received = bytes_received + VALUES(bytes_received),
    connection_count = connection_count + VALUES(connection_count)
"#;

        sqlx::query(UPSERT_QUERY)
            .bind(container)
            .bind(bucket.dest_ip.as_deref())
            .bind(bucket.dest_port)
            .bind(bucket.interval_start)
            .bind(bucket.bytes_sent)
            .bind(bucket.bytes_received)
            .bind(bucket.connection_count)
            .execute(&self.db)
            .await
            .map_err(Error::Insert)?;

        Ok(())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

        let result = sqlx::query("DELETE FROM traffic_flows WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.db)
            .await
            .map_err(Error::Cleanup)?;

        let removed = result.rows_affected();
        if removed > 0 {
            log::info!("cleaned up {removed} expired flow records");
        }

        Ok(removed)
    }
}
