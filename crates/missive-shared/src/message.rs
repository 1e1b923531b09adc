//! The message record and the offline-queue entry wrapping it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::receipts::{self, ReadReceiptState};
use crate::status::MessageStatus;
use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message at any point of its lifecycle, optimistic or confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Canonical ID once confirmed, provisional ID before that.
    pub id: MessageId,
    /// Provisional ID this record was created under, echoed by the backend.
    #[serde(default)]
    pub provisional_id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub client_timestamp: DateTime<Utc>,
    /// `None` until the backend has confirmed the message.
    #[serde(default)]
    pub server_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    pub status: MessageStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub is_optimistic: bool,
    #[serde(default)]
    pub is_offline_origin: bool,
    /// Why the message is `Failed`, shown next to the bubble.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Content-based identity of a logical send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub client_timestamp: DateTime<Utc>,
    pub text: String,
}

impl Message {
    /// A freshly composed, not yet confirmed message.
    pub fn optimistic(
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
        client_timestamp: DateTime<Utc>,
    ) -> Self {
        let id = MessageId::provisional();
        Self {
            provisional_id: Some(id.clone()),
            id,
            conversation_id,
            sender_id,
            text: text.into(),
            client_timestamp,
            server_timestamp: None,
            read_by: BTreeSet::new(),
            status: MessageStatus::Sending,
            retry_count: 0,
            is_optimistic: true,
            is_offline_origin: false,
            failure_reason: None,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            client_timestamp: self.client_timestamp,
            text: self.text.clone(),
        }
    }

    /// Ordering timestamp for the UI: server time once known.
    pub fn display_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp.unwrap_or(self.client_timestamp)
    }

    pub fn is_confirmed(&self) -> bool {
        self.server_timestamp.is_some() || self.status.is_confirmed()
    }

    /// Read-receipt aggregate against the conversation's current members.
    pub fn receipt_state(&self, members: &BTreeSet<UserId>) -> ReadReceiptState {
        receipts::aggregate(&self.read_by, members, &self.sender_id)
    }
}

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

/// A message held by the offline queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub message: Message,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Insertion counter, breaks `queued_at` ties.
    pub sequence: u64,
}

impl QueueEntry {
    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn retry_count(&self) -> u32 {
        self.message.retry_count
    }

    /// FIFO sort key.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.queued_at, self.sequence)
    }
}
