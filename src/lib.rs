use std::str::FromStr;
use std::sync::Arc;

/// Traffic Monitor: a per-host container network traffic observer.
///
/// This library attributes every Layer-4 flow crossing a known container
/// network to the container owning one of its endpoints, keeps a live
/// in-memory view of active flows, and persists completed flows to a SQL
/// database for historical querying and time-bucketed aggregation.
///
/// Flow events come from an abstract [`source::FlowSource`] (backed by the
/// kernel's connection tracking on supporting platforms); container
/// addresses come from an [`inventory::InventoryProvider`]. The
/// [`collector::Collector`] fuses the two, publishes lifecycle events to an
/// [`events::EventBus`], and writes completed flows through a
/// [`store::FlowStore`].
pub mod api;
pub mod attribution;
pub mod collector;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod flow;
pub mod inventory;
pub mod registry;
pub mod source;
pub mod store;

/// Runs the traffic monitor.
///
/// Wires configuration from the environment, opens the platform flow source
/// (falling back to degraded mode when unsupported), connects the store
/// when `DATABASE_URL` is set, and serves the query API until interrupted.
///
/// # Errors
///
/// Returns an error when the container table is malformed, the database
/// connection fails, or the shutdown signal cannot be installed.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::CollectorConfig::from_env();

    let provider = inventory::StaticProvider::from_str(
        std::env::var("CONTAINER_TABLE").unwrap_or_default().as_str(),
    )?;

    let store = match &config.store_connection_string {
        Some(url) => Some(store::MySqlFlowStore::connect(url).await?),
        None => {
            log::warn!(
                "environment variable `DATABASE_URL` not set; flow persistence and history queries are disabled"
            );
            None
        }
    };

    let bus = Arc::new(events::EventBus::new());
    let collector = Arc::new(collector::Collector::new(
        config,
        provider,
        source::open(),
        store,
        Arc::clone(&bus),
    ));
    collector.start();

    {
        let api = api::ApiServer::new(Arc::clone(&collector));
        tokio::spawn(async move { api.listen("0.0.0.0:3000").await });
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    collector.stop().await;

    Ok(())
}
