//! In-process publish/subscribe bus carrying worker lifecycle events
//! between channels and the dispatcher. Host observers may subscribe too;
//! delivery is ordered per publisher per subscriber, and a slow observer
//! lags (loses old events) rather than blocking publishers.

use data_model::{WorkerCapabilities, WorkerId};
use tokio::sync::broadcast;

use crate::error::DispatchError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ChannelReadyEvent {
    pub worker_id: WorkerId,
    pub language: String,
    pub capabilities: WorkerCapabilities,
}

#[derive(Debug, Clone)]
pub struct WorkerErrorEvent {
    pub worker_id: WorkerId,
    pub language: String,
    pub error: DispatchError,
    pub timestamp_ms: u64,
}

/// Lifecycle events observable on the bus.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A channel completed its handshake and accepts invocations.
    ChannelReady(ChannelReadyEvent),
    /// A channel failed; published exactly once per channel.
    WorkerError(WorkerErrorEvent),
    /// A worker exited with the intentional-restart exit code. Does not
    /// consume restart budget.
    WorkerRestartRequested { worker_id: WorkerId, language: String },
    /// A worker OS process exited.
    ProcessExited {
        worker_id: WorkerId,
        exit_code: Option<i32>,
    },
    /// The restart budget for a language was exceeded; published exactly
    /// once per language.
    PoolExhausted { language: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops the event.
    pub fn publish(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
