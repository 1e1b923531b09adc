//! Persistence for the bounded offline queue.

use missive_shared::{MessageId, QueueEntry};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{parse_timestamp, EncodedMessage, RawMessage, MESSAGE_COLUMNS, MESSAGE_COLUMN_COUNT};

const TABLE: &str = "queue_entries";

impl Database {
    /// Insert or replace a queue entry (retry bookkeeping included).
    pub fn upsert_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        let m = EncodedMessage::new(&entry.message)?;
        let sequence = i64::try_from(entry.sequence).map_err(|_| StoreError::Corrupt {
            table: TABLE,
            reason: format!("sequence {} out of range", entry.sequence),
        })?;
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO {TABLE} ({MESSAGE_COLUMNS}, queued_at, last_attempt_at, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                m.id,
                m.provisional_id,
                m.conversation_id,
                m.sender_id,
                m.text,
                m.client_timestamp,
                m.server_timestamp,
                m.read_by,
                m.status,
                m.retry_count,
                m.is_optimistic,
                m.is_offline_origin,
                m.failure_reason,
                entry.queued_at.to_rfc3339(),
                entry.last_attempt_at.map(|t| t.to_rfc3339()),
                sequence,
            ],
        )?;
        Ok(())
    }

    pub fn delete_queue_entry(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            &format!("DELETE FROM {TABLE} WHERE id = ?1"),
            params![id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Load the queue in FIFO order.
    ///
    /// Fails with [`StoreError::Corrupt`] if any row cannot be decoded.
    pub fn load_queue_entries(&self) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}, queued_at, last_attempt_at, sequence
             FROM {TABLE}
             ORDER BY queued_at ASC, sequence ASC"
        ))?;

        let rows = stmt.query_map([], |row| {
            let raw = RawMessage::from_row(row)?;
            let queued_at: String = row.get(MESSAGE_COLUMN_COUNT)?;
            let last_attempt_at: Option<String> = row.get(MESSAGE_COLUMN_COUNT + 1)?;
            let sequence: i64 = row.get(MESSAGE_COLUMN_COUNT + 2)?;
            Ok((raw, queued_at, last_attempt_at, sequence))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (raw, queued_at, last_attempt_at, sequence) =
                row.map_err(|e| StoreError::Corrupt {
                    table: TABLE,
                    reason: e.to_string(),
                })?;
            let message = raw.decode(TABLE)?;
            let corrupt = |reason: String| StoreError::Corrupt {
                table: TABLE,
                reason: format!("entry {}: {reason}", message.id),
            };

            let queued_at = parse_timestamp(&queued_at).map_err(|e| corrupt(e.to_string()))?;
            let last_attempt_at = last_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?;
            let sequence =
                u64::try_from(sequence).map_err(|_| corrupt(format!("sequence {sequence}")))?;

            entries.push(QueueEntry {
                message,
                queued_at,
                last_attempt_at,
                sequence,
            });
        }
        Ok(entries)
    }
}
