//! Read-only HTTP query surface over the collector and the flow store.
//!
//! Live endpoints serve the collector's snapshot-materialized view and stay
//! usable (returning empty results) in degraded mode; historical endpoints
//! require a configured store and answer `503` without one.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::collector::Collector;
use crate::flow::Protocol;
use crate::inventory::InventoryProvider;
use crate::source::FlowSource;
use crate::store::{self, AggregateQuery, FlowStore, HistoryQuery, Interval};

mod models;

use models::{
    AggregatesParams, AggregatesResponse, ConnectionsParams, ConnectionsResponse, HistoryParams,
    HistoryResponse, StatusResponse, SummaryParams, apply_connection_filters,
};

pub struct ApiServer {
    router: axum::Router,
}

impl ApiServer {
    pub fn new<P, S, F>(collector: Arc<Collector<P, S, F>>) -> Self
    where
        P: InventoryProvider,
        S: FlowSource,
        F: FlowStore,
    {
        let router = axum::Router::new()
            .route("/v1/connections", get(active_connections::<P, S, F>))
            .route("/v1/summary", get(summary::<P, S, F>))
            .route("/v1/history", get(history::<P, S, F>))
            .route("/v1/aggregates", get(aggregates::<P, S, F>))
            .route("/v1/status", get(status::<P, S, F>))
            .with_state(collector);
        Self { router }
    }

    pub async fn listen(self, addr: impl ToSocketAddrs) {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("TCP Listener bind");
        axum::serve(listener, self.router.into_make_service())
            .await
            .expect("HTTP server")
    }
}

async fn active_connections<P, S, F>(
    State(collector): State<Arc<Collector<P, S, F>>>,
    Query(params): Query<ConnectionsParams>,
) -> Response
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    let protocol = match params
        .protocol
        .as_deref()
        .map(str::parse::<Protocol>)
        .transpose()
    {
        Ok(protocol) => protocol,
        Err(err) => return bad_request(err.to_string()),
    };

    let flows = collector.get_connections(params.container.as_deref()).await;
    let (connections, total_count) = apply_connection_filters(flows, protocol, &params);

    Json(ConnectionsResponse {
        connections,
        total_count,
    })
    .into_response()
}

async fn summary<P, S, F>(
    State(collector): State<Arc<Collector<P, S, F>>>,
    Query(params): Query<SummaryParams>,
) -> Response
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    Json(collector.get_summary(&params.container).await).into_response()
}

async fn history<P, S, F>(
    State(collector): State<Arc<Collector<P, S, F>>>,
    Query(params): Query<HistoryParams>,
) -> Response
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    let Some(store) = collector.store() else {
        return unavailable();
    };

    let query = HistoryQuery {
        container: params.container,
        start: params.start,
        end: params.end,
        dest_ip: params.dest_ip,
        dest_port: params.dest_port,
        offset: params.offset.unwrap_or(0),
        limit: params.limit,
    };

    match store.query_history(&query).await {
        Ok((rows, total_count)) => Json(HistoryResponse {
            rows: rows.into_iter().map(Into::into).collect(),
            total_count,
        })
        .into_response(),
        Err(err) => {
            log::error!("failed to query flow history: {err}");
            internal("failed to query flow history")
        }
    }
}

async fn aggregates<P, S, F>(
    State(collector): State<Arc<Collector<P, S, F>>>,
    Query(params): Query<AggregatesParams>,
) -> Response
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    let Some(store) = collector.store() else {
        return unavailable();
    };

    let interval = match params.interval.as_deref().unwrap_or("1h").parse::<Interval>() {
        Ok(interval) => interval,
        Err(err) => return bad_request(err.to_string()),
    };

    let query = AggregateQuery {
        container: params.container,
        start: params.start,
        end: params.end,
        interval,
        group_by_dest_ip: params.group_by_dest_ip.unwrap_or(false),
        group_by_dest_port: params.group_by_dest_port.unwrap_or(false),
    };

    match store.aggregate(&query).await {
        Ok(buckets) => Json(AggregatesResponse { buckets }).into_response(),
        Err(err @ store::Error::IntervalTooFine(_)) => bad_request(err.to_string()),
        Err(err) => {
            log::error!("failed to query traffic aggregates: {err}");
            internal("failed to query traffic aggregates")
        }
    }
}

async fn status<P, S, F>(State(collector): State<Arc<Collector<P, S, F>>>) -> Response
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    Json(StatusResponse {
        available: collector.is_available(),
        error: collector.error(),
    })
    .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "flow persistence is not configured",
    )
        .into_response()
}

fn internal(message: &'static str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
