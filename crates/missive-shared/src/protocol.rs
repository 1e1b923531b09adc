use serde::{Deserialize, Serialize};

use crate::message::Message;

/// What happened to the record carried by a [`MessageSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Added,
    Modified,
    Removed,
}

/// One item of a conversation subscription: the backend's current view of a
/// message. Snapshots for a conversation arrive in order and deduplicated
/// by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub kind: SnapshotKind,
    pub message: Message,
}

impl MessageSnapshot {
    pub fn added(message: Message) -> Self {
        Self {
            kind: SnapshotKind::Added,
            message,
        }
    }

    pub fn modified(message: Message) -> Self {
        Self {
            kind: SnapshotKind::Modified,
            message,
        }
    }

    pub fn removed(message: Message) -> Self {
        Self {
            kind: SnapshotKind::Removed,
            message,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
