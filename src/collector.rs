//! Traffic collector: wires the directory, flow source, registry, store,
//! and event bus together and runs the background loops.
//!
//! All loops share one cancellation token. The event loop applies flow
//! events in arrival order; the snapshot loop periodically rebuilds the
//! registry from a full flow table dump, reconciling whatever the lossy
//! event channel missed. Completed flows are persisted by a bounded worker
//! group; the store's unique flow-id index keeps replays harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::attribution;
use crate::config::CollectorConfig;
use crate::directory::DirectoryCache;
use crate::error::ResultOkLogExt;
use crate::events::{EventBus, TrafficEvent};
use crate::flow::{AttributedFlow, FlowEvent, FlowEventKind, Protocol};
use crate::inventory::InventoryProvider;
use crate::registry::FlowRegistry;
use crate::source::{self, FlowSource};
use crate::store::FlowStore;

/// Capacity of the queue between the event loop and the persist workers.
const PERSIST_QUEUE: usize = 256;

/// Aggregate statistics over a container's active flows.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionSummary {
    pub container_name: String,
    pub active_connections: u64,
    pub tcp_connections: u64,
    pub udp_connections: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub top_destinations: Vec<DestinationStats>,
}

/// Per-destination-IP totals within a summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DestinationStats {
    pub dest_ip: String,
    pub connection_count: u64,
    pub bytes_total: u64,
}

/// Orchestrates flow ingestion, attribution, and persistence for one host.
pub struct Collector<P, S, F> {
    config: CollectorConfig,
    directory: Arc<DirectoryCache<P>>,
    registry: Arc<FlowRegistry>,
    source: Option<Arc<S>>,
    source_error: Option<source::Error>,
    store: Option<Arc<F>>,
    bus: Arc<EventBus>,
    events_rx: Mutex<Option<mpsc::Receiver<FlowEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P, S, F> Collector<P, S, F>
where
    P: InventoryProvider,
    S: FlowSource,
    F: FlowStore,
{
    /// Creates a collector over the given collaborators.
    ///
    /// A failed flow source does not fail construction: the collector runs
    /// degraded, serving empty live reads while historical queries keep
    /// working through the store.
    pub fn new(
        config: CollectorConfig,
        provider: P,
        source: source::Result<S>,
        store: Option<F>,
        bus: Arc<EventBus>,
    ) -> Self {
        let directory = Arc::new(DirectoryCache::new(
            provider,
            config.network_cidr.as_deref(),
        ));

        let (source, events_rx, source_error) = match source {
            Ok(source) => {
                let rx = source.events();
                (Some(Arc::new(source)), rx, None)
            }
            Err(err) => {
                log::warn!("flow monitoring unavailable: {err}");
                (None, None, Some(err))
            }
        };

        Self {
            config,
            directory,
            registry: Arc::new(FlowRegistry::new()),
            source,
            source_error,
            store: store.map(Arc::new),
            bus,
            events_rx: Mutex::new(events_rx),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the background loops. Call once.
    pub fn start(&self) {
        log::info!(
            "starting traffic collector for network {}",
            self.config.network_cidr.as_deref().unwrap_or("<unset>")
        );

        let mut tasks = self.lock_tasks();

        {
            let directory = Arc::clone(&self.directory);
            let period = self.config.directory_refresh_interval;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                directory.run_refresh(period, cancel).await;
            }));
        }

        let persist_tx = match (&self.store, &self.source) {
            (Some(store), Some(_)) => {
                let (tx, rx) = mpsc::channel(PERSIST_QUEUE);
                let store = Arc::clone(store);
                let workers = self.config.persist_workers;
                tasks.push(tokio::spawn(run_persist_workers(rx, store, workers)));
                Some(tx)
            }
            _ => None,
        };

        if let Some(mut rx) = self.take_events_rx() {
            let directory = Arc::clone(&self.directory);
            let registry = Arc::clone(&self.registry);
            let bus = Arc::clone(&self.bus);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            process_event(event, &directory, &registry, &bus, persist_tx.as_ref())
                                .await;
                        }
                    }
                }
            }));
        }

        if let Some(src) = &self.source {
            let source = Arc::clone(src);
            let directory = Arc::clone(&self.directory);
            let registry = Arc::clone(&self.registry);
            let interval = self.config.snapshot_interval;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            reconcile(source.as_ref(), &directory, &registry).await;
                        }
                    }
                }
            }));
        }

        if let Some(st) = &self.store {
            let store = Arc::clone(st);
            let interval = self.config.cleanup_interval;
            let retention_days = self.config.retention_days;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = store.cleanup(retention_days).await {
                                log::warn!("flow history cleanup failed: {err}");
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Returns the active flows, freshest-first semantics.
    ///
    /// Forces a directory refresh when the cache is empty and a synchronous
    /// flow table dump when a source is available, so readers see the
    /// authoritative kernel state rather than the drifted event-driven view.
    pub async fn get_connections(&self, container: Option<&str>) -> Vec<AttributedFlow> {
        if self.directory.size() == 0 {
            let _ = self.directory.refresh().await.ok_warn();
        }
        if let Some(source) = &self.source {
            reconcile(source.as_ref(), &self.directory, &self.registry).await;
        }
        self.registry.snapshot_filtered(container)
    }

    /// Folds the container's active flows into aggregate statistics.
    pub async fn get_summary(&self, container: &str) -> ConnectionSummary {
        let flows = self.get_connections(Some(container)).await;
        summarize(container, &flows)
    }

    /// False when the collector runs without a kernel flow source.
    pub fn is_available(&self) -> bool {
        self.source.is_some()
    }

    /// Describes why live monitoring is unavailable, if it is.
    pub fn error(&self) -> Option<String> {
        self.source_error
            .as_ref()
            .map(|err| format!("flow monitoring unavailable: {err}"))
    }

    pub fn store(&self) -> Option<&F> {
        self.store.as_deref()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Stops all loops and closes the flow source. Idempotent; returns once
    /// every loop has exited.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(source) = &self.source {
            source.close();
        }

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await.ok_log();
        }
    }

    fn take_events_rx(&self) -> Option<mpsc::Receiver<FlowEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Applies one flow event: attribute, update the registry, notify the bus,
/// and on destroy hand the completed flow to the persist workers.
///
/// Unattributed events are dropped without side effects.
async fn process_event<P: InventoryProvider>(
    event: FlowEvent,
    directory: &DirectoryCache<P>,
    registry: &FlowRegistry,
    bus: &EventBus,
    persist_tx: Option<&mpsc::Sender<AttributedFlow>>,
) {
    let Some(mut flow) = attribution::attribute(&event, directory) else {
        return;
    };

    match event.kind {
        FlowEventKind::Destroy => {
            if let Some(prior) = registry.remove(&flow.id) {
                flow.first_seen = prior.first_seen;
            }
            if let Some(tx) = persist_tx {
                if tx.send(flow.clone()).await.is_err() {
                    log::warn!("persist queue closed, dropping completed flow {}", flow.id);
                }
            }
        }
        FlowEventKind::New | FlowEventKind::Update => registry.upsert(flow.clone()),
    }

    bus.publish(&TrafficEvent {
        kind: event.kind,
        flow,
        timestamp: Utc::now(),
    });
}

/// Rebuilds the registry from a full flow table dump.
///
/// The dump is authoritative: flows absent from it are evicted without
/// being persisted, since snapshot eviction is not a destroy.
async fn reconcile<S, P>(source: &S, directory: &DirectoryCache<P>, registry: &FlowRegistry)
where
    S: FlowSource,
    P: InventoryProvider,
{
    match source.snapshot().await {
        Ok(events) => {
            let mut flows = HashMap::with_capacity(events.len());
            for event in events {
                if let Some(flow) = attribution::attribute(&event, directory) {
                    flows.insert(flow.id.clone(), flow);
                }
            }
            log::trace!("flow table snapshot reconciled: {} attributed flows", flows.len());
            registry.replace_all(flows);
        }
        Err(err) => log::warn!("failed to take flow table snapshot: {err}"),
    }
}

/// Consumes persist tasks with bounded concurrency until the queue closes,
/// then waits for in-flight saves to finish.
async fn run_persist_workers<F: FlowStore>(
    mut rx: mpsc::Receiver<AttributedFlow>,
    store: Arc<F>,
    workers: usize,
) {
    let workers = workers.max(1) as u32;
    let semaphore = Arc::new(Semaphore::new(workers as usize));

    while let Some(flow) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = store.save_completed(&flow).await {
                log::warn!("failed to persist completed flow {}: {err}", flow.id);
            }
        });
    }

    let _ = semaphore.acquire_many(workers).await;
}

/// Folds a flow list into a [`ConnectionSummary`].
fn summarize(container: &str, flows: &[AttributedFlow]) -> ConnectionSummary {
    let mut summary = ConnectionSummary {
        container_name: container.to_owned(),
        active_connections: flows.len() as u64,
        ..ConnectionSummary::default()
    };

    let mut destinations: HashMap<String, (u64, u64)> = HashMap::new();
    for flow in flows {
        match flow.protocol {
            Protocol::Tcp => summary.tcp_connections += 1,
            Protocol::Udp => summary.udp_connections += 1,
            _ => {}
        }
        summary.total_bytes_sent += flow.bytes_sent;
        summary.total_bytes_received += flow.bytes_received;

        let entry = destinations.entry(flow.dest_ip.to_string()).or_default();
        entry.0 += 1;
        entry.1 += flow.bytes_sent + flow.bytes_received;
    }

    summary.top_destinations = destinations
        .into_iter()
        .map(|(dest_ip, (connection_count, bytes_total))| DestinationStats {
            dest_ip,
            connection_count,
            bytes_total,
        })
        .collect();

    summary
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::events::EventFilter;
    use crate::flow::TcpState;
    use crate::inventory::{self, ContainerAddress, StaticProvider};
    use crate::store::{AggregateQuery, HistoryQuery, PersistedFlow, TrafficBucket};

    struct FakeSource {
        rx: StdMutex<Option<mpsc::Receiver<FlowEvent>>>,
        table: StdMutex<Vec<FlowEvent>>,
    }

    impl FakeSource {
        fn new(table: Vec<FlowEvent>) -> (Self, crate::source::EventSender) {
            let (sender, rx) = crate::source::event_channel(crate::source::DEFAULT_EVENT_BUFFER);
            (
                Self {
                    rx: StdMutex::new(Some(rx)),
                    table: StdMutex::new(table),
                },
                sender,
            )
        }
    }

    impl FlowSource for FakeSource {
        fn events(&self) -> Option<mpsc::Receiver<FlowEvent>> {
            self.rx.lock().unwrap().take()
        }

        async fn snapshot(&self) -> crate::source::Result<Vec<FlowEvent>> {
            Ok(self.table.lock().unwrap().clone())
        }

        fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeStore {
        saved: StdMutex<Vec<AttributedFlow>>,
    }

    impl FlowStore for FakeStore {
        async fn save_completed(&self, flow: &AttributedFlow) -> crate::store::Result<()> {
            let mut saved = self.saved.lock().unwrap();
            if !saved.iter().any(|existing| existing.id == flow.id) {
                saved.push(flow.clone());
            }
            Ok(())
        }

        async fn has_flow(&self, flow_id: &str) -> crate::store::Result<bool> {
            Ok(self.saved.lock().unwrap().iter().any(|f| f.id == flow_id))
        }

        async fn query_history(
            &self,
            query: &HistoryQuery,
        ) -> crate::store::Result<(Vec<PersistedFlow>, u64)> {
            let _ = query;
            Ok((Vec::new(), 0))
        }

        async fn aggregate(
            &self,
            query: &AggregateQuery,
        ) -> crate::store::Result<Vec<TrafficBucket>> {
            let _ = query;
            Ok(Vec::new())
        }

        async fn save_bucket(
            &self,
            _container: &str,
            _bucket: &TrafficBucket,
        ) -> crate::store::Result<()> {
            Ok(())
        }

        async fn cleanup(&self, _retention_days: u32) -> crate::store::Result<u64> {
            Ok(0)
        }
    }

    struct CountingProvider {
        calls: AtomicUsize,
        containers: Vec<ContainerAddress>,
    }

    impl InventoryProvider for CountingProvider {
        async fn list(&self) -> inventory::Result<Vec<ContainerAddress>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.containers.clone())
        }
    }

    fn tcp_event(
        id: &str,
        kind: FlowEventKind,
        src: &str,
        dst: &str,
        bytes_orig: u64,
        bytes_reply: u64,
    ) -> FlowEvent {
        FlowEvent {
            id: id.to_owned(),
            kind,
            protocol: Protocol::Tcp,
            src_ip: src.parse().unwrap(),
            src_port: 40000,
            dst_ip: dst.parse().unwrap(),
            dst_port: 443,
            tcp_state: Some(TcpState::Established),
            bytes_orig,
            bytes_reply,
            packets_orig: bytes_orig / 100,
            packets_reply: bytes_reply / 100,
            timeout_seconds: 120,
            observed_at: Utc::now(),
        }
    }

    async fn directory(table: &str) -> Arc<DirectoryCache<StaticProvider>> {
        let cache = DirectoryCache::new(table.parse().unwrap(), Some("10.0.0.0/24"));
        cache.refresh().await.unwrap();
        Arc::new(cache)
    }

    #[tokio::test]
    async fn test_new_event_lands_in_registry_as_egress() {
        let directory = directory("a=10.0.0.5").await;
        let registry = FlowRegistry::new();
        let bus = EventBus::new();

        let event = tcp_event("1", FlowEventKind::New, "10.0.0.5", "93.184.216.34", 1200, 3400);
        process_event(event, &directory, &registry, &bus, None).await;

        let flows = registry.snapshot_filtered(Some("a"));
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].direction, crate::flow::Direction::Egress);
        assert_eq!(flows[0].bytes_sent, 1200);
        assert_eq!(flows[0].bytes_received, 3400);
    }

    #[tokio::test]
    async fn test_destroy_persists_once_with_preserved_first_seen() {
        let directory = directory("a=10.0.0.5").await;
        let registry = FlowRegistry::new();
        let bus = EventBus::new();
        let store = Arc::new(FakeStore::default());
        let (persist_tx, persist_rx) = mpsc::channel(8);

        let new_event =
            tcp_event("1", FlowEventKind::New, "10.0.0.5", "93.184.216.34", 1200, 3400);
        let started_at = new_event.observed_at;
        process_event(new_event, &directory, &registry, &bus, Some(&persist_tx)).await;

        let mut destroy =
            tcp_event("1", FlowEventKind::Destroy, "10.0.0.5", "93.184.216.34", 1500, 4000);
        destroy.observed_at = started_at + ChronoDuration::seconds(42);
        process_event(destroy, &directory, &registry, &bus, Some(&persist_tx)).await;

        drop(persist_tx);
        run_persist_workers(persist_rx, Arc::clone(&store), 2).await;

        assert_eq!(registry.size(), 0);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].bytes_sent, 1500);
        assert_eq!(saved[0].bytes_received, 4000);
        assert_eq!(saved[0].first_seen, started_at);
        assert_eq!(saved[0].last_seen, started_at + ChronoDuration::seconds(42));
    }

    #[tokio::test]
    async fn test_external_flow_produces_no_state_and_no_event() {
        let directory = directory("").await;
        let registry = FlowRegistry::new();
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::default());

        let event = tcp_event("9", FlowEventKind::New, "192.0.2.1", "198.51.100.7", 10, 10);
        process_event(event, &directory, &registry, &bus, None).await;

        assert_eq!(registry.size(), 0);
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attributed_events_reach_subscribers() {
        let directory = directory("a=10.0.0.5").await;
        let registry = FlowRegistry::new();
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::default());

        let event = tcp_event("1", FlowEventKind::New, "10.0.0.5", "93.184.216.34", 1, 1);
        process_event(event, &directory, &registry, &bus, None).await;

        let received = sub.events.try_recv().unwrap();
        assert_eq!(received.kind, FlowEventKind::New);
        assert_eq!(received.flow.container_name, "a");
    }

    #[tokio::test]
    async fn test_snapshot_reconciliation_evicts_without_persisting() {
        let directory = directory("c=10.0.0.9").await;
        let registry = FlowRegistry::new();
        let bus = EventBus::new();

        // Registry holds flow 3; the kernel table only knows flow 4.
        let stale = tcp_event("3", FlowEventKind::New, "10.0.0.9", "93.184.216.34", 1, 1);
        process_event(stale, &directory, &registry, &bus, None).await;

        let (source, _sender) = FakeSource::new(vec![tcp_event(
            "4",
            FlowEventKind::Update,
            "10.0.0.9",
            "198.51.100.7",
            5,
            5,
        )]);
        reconcile(&source, &directory, &registry).await;

        let flows = registry.snapshot_filtered(None);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id, "4");
    }

    #[tokio::test]
    async fn test_event_loop_end_to_end() {
        let (source, sender) = FakeSource::new(Vec::new());
        let bus = Arc::new(EventBus::new());
        let provider: StaticProvider = "a=10.0.0.5".parse().unwrap();
        let collector = Collector::new(
            CollectorConfig {
                network_cidr: Some("10.0.0.0/24".to_owned()),
                ..CollectorConfig::default()
            },
            provider,
            Ok(source),
            Some(FakeStore::default()),
            Arc::clone(&bus),
        );

        collector.start();
        // Give the refresh loop a moment to populate the directory.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        sender.send(tcp_event("1", FlowEventKind::New, "10.0.0.5", "93.184.216.34", 100, 200));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(collector.is_available());
        let flows = collector.registry.snapshot_filtered(Some("a"));
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id, "1");

        collector.stop().await;
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_degraded_mode_serves_empty_reads() {
        let provider: StaticProvider = "a=10.0.0.5".parse().unwrap();
        let collector: Collector<_, FakeSource, FakeStore> = Collector::new(
            CollectorConfig::default(),
            provider,
            Err(crate::source::Error::Unsupported),
            None,
            Arc::new(EventBus::new()),
        );

        assert!(!collector.is_available());
        assert!(collector.error().unwrap().contains("not supported"));
        assert!(collector.get_connections(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_path_refreshes_empty_directory() {
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            containers: vec![ContainerAddress {
                name: "a".to_owned(),
                ip: "10.0.0.5".parse().unwrap(),
            }],
        };
        let (source, _sender) = FakeSource::new(vec![tcp_event(
            "1",
            FlowEventKind::Update,
            "10.0.0.5",
            "93.184.216.34",
            7,
            3,
        )]);
        let collector = Collector::new(
            CollectorConfig::default(),
            provider,
            Ok(source),
            None::<FakeStore>,
            Arc::new(EventBus::new()),
        );

        let flows = collector.get_connections(Some("a")).await;
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].bytes_sent, 7);
    }

    #[test]
    fn test_summarize_folds_protocols_totals_and_destinations() {
        let make = |id: &str, proto: Protocol, dest: &str, sent: u64, received: u64| {
            AttributedFlow {
                id: id.to_owned(),
                container_name: "a".to_owned(),
                container_ip: "10.0.0.5".parse().unwrap(),
                protocol: proto,
                source_ip: "10.0.0.5".parse().unwrap(),
                source_port: 40000,
                dest_ip: dest.parse().unwrap(),
                dest_port: 443,
                tcp_state: None,
                direction: crate::flow::Direction::Egress,
                bytes_sent: sent,
                bytes_received: received,
                packets_sent: 1,
                packets_received: 1,
                timeout_seconds: 60,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
            }
        };

        let flows = vec![
            make("1", Protocol::Tcp, "93.184.216.34", 100, 200),
            make("2", Protocol::Tcp, "93.184.216.34", 10, 20),
            make("3", Protocol::Udp, "198.51.100.7", 1, 2),
        ];

        let summary = summarize("a", &flows);
        assert_eq!(summary.active_connections, 3);
        assert_eq!(summary.tcp_connections, 2);
        assert_eq!(summary.udp_connections, 1);
        assert_eq!(summary.total_bytes_sent, 111);
        assert_eq!(summary.total_bytes_received, 222);
        assert_eq!(summary.top_destinations.len(), 2);

        let example = summary
            .top_destinations
            .iter()
            .find(|d| d.dest_ip == "93.184.216.34")
            .unwrap();
        assert_eq!(example.connection_count, 2);
        assert_eq!(example.bytes_total, 330);
    }
}
