//! Flow source contract: the kernel connection-tracking feed.
//!
//! A [`FlowSource`] emits a bounded stream of [`FlowEvent`]s and answers
//! on-demand dumps of the full flow table. Backends are platform-specific
//! and register by implementing the trait; [`open`] selects the platform
//! backend at runtime and reports [`Error::Unsupported`] where none exists,
//! in which case the collector runs in degraded mode.

mod error;
mod sender;
mod stub;

use tokio::sync::mpsc;

use crate::flow::FlowEvent;

pub use error::{Error, Result};
pub use sender::{EventSender, event_channel};
pub use stub::{PlatformSource, open};

/// Default capacity of the live event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// A live feed of kernel flow events plus on-demand table dumps.
///
/// Implementations must not serve `snapshot()` over the same kernel
/// subscription that feeds `events()`: subscription sockets cannot answer
/// dump requests concurrently, so the two need distinct handles.
pub trait FlowSource: Send + Sync + 'static {
    /// Takes the live event stream.
    ///
    /// The stream is handed out once; subsequent calls return `None`. The
    /// producer side never blocks: when the channel is full the event is
    /// dropped and counted, and the periodic snapshot reconciles the loss.
    fn events(&self) -> Option<mpsc::Receiver<FlowEvent>>;

    /// Dumps the full current flow table.
    ///
    /// Usable concurrently with the live subscription.
    fn snapshot(&self) -> impl std::future::Future<Output = Result<Vec<FlowEvent>>> + Send;

    /// Stops the subscription, closes the event channel, and releases
    /// kernel resources. Idempotent.
    fn close(&self);
}
