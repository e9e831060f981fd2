use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::flow::FlowEvent;

/// Creates the bounded event channel a flow source feeds.
///
/// The returned [`EventSender`] drops events instead of blocking when the
/// channel is full; the receiver side goes to the collector's event loop.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<FlowEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Producer handle for the live event stream.
///
/// Sends are non-blocking: a full channel drops the event and increments the
/// drop counter. Lost events are recovered by the next full-table snapshot.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<FlowEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Offers an event to the channel, dropping it when the channel is full
    /// or the receiver is gone.
    pub fn send(&self, event: FlowEvent) {
        if let Err(err) = self.tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!("flow event channel full, dropping event ({total} dropped so far)");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Total number of events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
