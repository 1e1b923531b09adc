//! Persistence for unconfirmed optimistic messages.

use missive_shared::{Message, MessageId};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{EncodedMessage, RawMessage, MESSAGE_COLUMNS};

const TABLE: &str = "ledger_messages";

impl Database {
    /// Insert or replace an optimistic ledger entry.
    pub fn upsert_ledger_message(&self, message: &Message) -> Result<()> {
        let m = EncodedMessage::new(message)?;
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO {TABLE} ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
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
            ],
        )?;
        Ok(())
    }

    pub fn delete_ledger_message(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            &format!("DELETE FROM {TABLE} WHERE id = ?1"),
            params![id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Load every persisted ledger entry, oldest first.
    ///
    /// Fails with [`StoreError::Corrupt`] if any row cannot be decoded.
    pub fn load_ledger_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM {TABLE} ORDER BY client_timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map([], RawMessage::from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StoreError::Corrupt {
                table: TABLE,
                reason: e.to_string(),
            })?;
            messages.push(raw.decode(TABLE)?);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use missive_shared::MessageStatus;

    use super::*;

    fn message(text: &str, secs: i64) -> Message {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Message::optimistic("c1".into(), "alice".into(), text, ts)
    }

    #[test]
    fn upsert_overwrites_then_delete() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = message("hello", 0);
        msg.read_by.insert("bob".into());
        db.upsert_ledger_message(&msg).unwrap();

        msg.status = MessageStatus::Failed;
        msg.failure_reason = Some("boom".into());
        db.upsert_ledger_message(&msg).unwrap();

        assert_eq!(db.load_ledger_messages().unwrap(), [msg.clone()]);

        assert!(db.delete_ledger_message(&msg.id).unwrap());
        assert!(!db.delete_ledger_message(&msg.id).unwrap());
        assert!(db.load_ledger_messages().unwrap().is_empty());
    }

    #[test]
    fn load_orders_by_client_time() {
        let db = Database::open_in_memory().unwrap();
        let later = message("later", 10);
        let earlier = message("earlier", 1);
        db.upsert_ledger_message(&later).unwrap();
        db.upsert_ledger_message(&earlier).unwrap();

        let texts: Vec<_> = db
            .load_ledger_messages()
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["earlier", "later"]);
    }

    #[test]
    fn corrupt_status_fails_loudly() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("hello", 0);
        db.upsert_ledger_message(&msg).unwrap();
        db.conn()
            .execute(
                "UPDATE ledger_messages SET status = 'teleported' WHERE id = ?1",
                params![msg.id.as_str()],
            )
            .unwrap();

        assert!(matches!(
            db.load_ledger_messages(),
            Err(StoreError::Corrupt { table: "ledger_messages", .. })
        ));
    }
}
