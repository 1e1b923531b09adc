//! Engine events pushed to the UI layer.

use missive_shared::{ConnectionState, Message, MessageId};
use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_MESSAGE_UPSERTED: &str = "message-upserted";
pub const EVENT_MESSAGE_RECONCILED: &str = "message-reconciled";
pub const EVENT_MESSAGE_REMOVED: &str = "message-removed";
pub const EVENT_MESSAGE_FAILED: &str = "message-failed";
pub const EVENT_QUEUE_EVICTION: &str = "queue-eviction";
pub const EVENT_CONNECTION_CHANGED: &str = "connection-changed";
pub const EVENT_SYNC_PROGRESS: &str = "sync-progress";

/// UI-facing view of the offline queue and drain progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncStatistics {
    pub queued: usize,
    pub is_syncing: bool,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// A message became visible or changed.
    MessageUpserted(Message),
    /// An optimistic entry was replaced by its confirmed record.
    MessageReconciled {
        provisional: MessageId,
        message: Message,
    },
    /// A message left the view (discarded or deleted remotely).
    MessageRemoved { id: MessageId },
    /// A message entered `Failed`.
    MessageFailed { id: MessageId, reason: String },
    /// The offline queue was full and pushed out its oldest entry.
    QueueEviction { evicted: MessageId },
    ConnectionChanged(ConnectionState),
    SyncProgress(SyncStatistics),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageUpserted(_) => EVENT_MESSAGE_UPSERTED,
            Self::MessageReconciled { .. } => EVENT_MESSAGE_RECONCILED,
            Self::MessageRemoved { .. } => EVENT_MESSAGE_REMOVED,
            Self::MessageFailed { .. } => EVENT_MESSAGE_FAILED,
            Self::QueueEviction { .. } => EVENT_QUEUE_EVICTION,
            Self::ConnectionChanged(_) => EVENT_CONNECTION_CHANGED,
            Self::SyncProgress(_) => EVENT_SYNC_PROGRESS,
        }
    }
}

/// Broadcast fan-out of [`EngineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No event subscribers");
        }
    }
}
