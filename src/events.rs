//! Lifecycle event fan-out.
//!
//! The collector publishes one [`TrafficEvent`] per attributed flow
//! transition. Delivery is best-effort per subscriber: each subscription
//! owns a bounded buffer and slow consumers lose events instead of
//! backpressuring the collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::flow::{AttributedFlow, FlowEventKind};

/// Per-subscriber event buffer capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// A flow lifecycle notification with its wall-clock publication time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrafficEvent {
    pub kind: FlowEventKind,
    pub flow: AttributedFlow,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber-side event selection.
///
/// An empty filter matches everything; `kinds` and `container` narrow by
/// event type and container name respectively.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct EventFilter {
    pub container: Option<String>,
    #[serde(default)]
    pub kinds: Vec<FlowEventKind>,
}

impl EventFilter {
    pub fn matches(&self, event: &TrafficEvent) -> bool {
        if let Some(container) = &self.container {
            if event.flow.container_name != *container {
                return false;
            }
        }
        self.kinds.is_empty() || self.kinds.contains(&event.kind)
    }
}

/// A live subscription handed to one consumer.
///
/// The `events` channel closing is the done signal: it closes when the
/// subscription is dropped via [`EventBus::unsubscribe`] or the bus goes
/// away.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<TrafficEvent>,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<TrafficEvent>,
}

/// Fan-out hub between the collector and event consumers.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Creates a bus with a custom per-subscriber buffer capacity.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            buffer,
        }
    }

    /// Registers a subscriber and returns its subscription handle.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        self.lock().insert(id, Subscriber { filter, tx });

        Subscription { id, events: rx }
    }

    /// Removes a subscriber; its event channel closes.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Delivers an event to every matching subscriber.
    ///
    /// Subscribers with a full buffer lose the event; subscribers whose
    /// receiver is gone are removed.
    pub fn publish(&self, event: &TrafficEvent) {
        let mut subscribers = self.lock();
        let mut stale = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("subscriber {id} buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(*id),
            }
        }

        for id in stale {
            subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Total events dropped across all subscribers.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
