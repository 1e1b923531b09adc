//! Column codec shared by the ledger and queue tables.
//!
//! Rows are first read into [`RawMessage`] (plain SQLite values) and then
//! decoded into a [`Message`]; any decoding failure becomes
//! [`StoreError::Corrupt`] so a damaged row stops the engine from starting
//! instead of being dropped.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use missive_shared::{Message, MessageStatus, UserId};

use crate::error::{Result, StoreError};

pub(crate) const MESSAGE_COLUMNS: &str = "id, provisional_id, conversation_id, sender_id, text, \
     client_timestamp, server_timestamp, read_by, status, retry_count, \
     is_optimistic, is_offline_origin, failure_reason";

/// Number of columns in [`MESSAGE_COLUMNS`].
pub(crate) const MESSAGE_COLUMN_COUNT: usize = 13;

pub(crate) struct RawMessage {
    id: String,
    provisional_id: Option<String>,
    conversation_id: String,
    sender_id: String,
    text: String,
    client_timestamp: String,
    server_timestamp: Option<String>,
    read_by: String,
    status: String,
    retry_count: i64,
    is_optimistic: bool,
    is_offline_origin: bool,
    failure_reason: Option<String>,
}

impl RawMessage {
    /// Read the message columns starting at index 0.
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provisional_id: row.get(1)?,
            conversation_id: row.get(2)?,
            sender_id: row.get(3)?,
            text: row.get(4)?,
            client_timestamp: row.get(5)?,
            server_timestamp: row.get(6)?,
            read_by: row.get(7)?,
            status: row.get(8)?,
            retry_count: row.get(9)?,
            is_optimistic: row.get(10)?,
            is_offline_origin: row.get(11)?,
            failure_reason: row.get(12)?,
        })
    }

    pub(crate) fn decode(self, table: &'static str) -> Result<Message> {
        let corrupt = |reason: String| StoreError::Corrupt { table, reason };

        let status = MessageStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("message {}: unknown status {:?}", self.id, self.status)))?;
        let read_by: BTreeSet<UserId> = serde_json::from_str(&self.read_by)
            .map_err(|e| corrupt(format!("message {}: read_by: {e}", self.id)))?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| corrupt(format!("message {}: retry_count {}", self.id, self.retry_count)))?;
        let client_timestamp = parse_timestamp(&self.client_timestamp)
            .map_err(|e| corrupt(format!("message {}: client_timestamp: {e}", self.id)))?;
        let server_timestamp = self
            .server_timestamp
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| corrupt(format!("message {}: server_timestamp: {e}", self.id)))?;

        Ok(Message {
            id: self.id.into(),
            provisional_id: self.provisional_id.map(Into::into),
            conversation_id: self.conversation_id.into(),
            sender_id: self.sender_id.into(),
            text: self.text,
            client_timestamp,
            server_timestamp,
            read_by,
            status,
            retry_count,
            is_optimistic: self.is_optimistic,
            is_offline_origin: self.is_offline_origin,
            failure_reason: self.failure_reason,
        })
    }
}

/// Column values for [`MESSAGE_COLUMNS`], in order.
pub(crate) struct EncodedMessage {
    pub id: String,
    pub provisional_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub client_timestamp: String,
    pub server_timestamp: Option<String>,
    pub read_by: String,
    pub status: &'static str,
    pub retry_count: u32,
    pub is_optimistic: bool,
    pub is_offline_origin: bool,
    pub failure_reason: Option<String>,
}

impl EncodedMessage {
    pub(crate) fn new(message: &Message) -> Result<Self> {
        Ok(Self {
            id: message.id.to_string(),
            provisional_id: message.provisional_id.as_ref().map(ToString::to_string),
            conversation_id: message.conversation_id.to_string(),
            sender_id: message.sender_id.to_string(),
            text: message.text.clone(),
            client_timestamp: message.client_timestamp.to_rfc3339(),
            server_timestamp: message.server_timestamp.map(|t| t.to_rfc3339()),
            read_by: serde_json::to_string(&message.read_by)?,
            status: message.status.as_str(),
            retry_count: message.retry_count,
            is_optimistic: message.is_optimistic,
            is_offline_origin: message.is_offline_origin,
            failure_reason: message.failure_reason.clone(),
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
