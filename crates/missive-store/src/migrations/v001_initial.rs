//! v001 -- Initial schema creation.
//!
//! Creates the two engine tables: `ledger_messages` (unconfirmed optimistic
//! messages) and `queue_entries` (the bounded offline queue).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Optimistic ledger (unconfirmed messages only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS ledger_messages (
    id                TEXT PRIMARY KEY NOT NULL,
    provisional_id    TEXT,
    conversation_id   TEXT NOT NULL,
    sender_id         TEXT NOT NULL,
    text              TEXT NOT NULL,
    client_timestamp  TEXT NOT NULL,              -- RFC-3339
    server_timestamp  TEXT,                       -- NULL = unconfirmed
    read_by           TEXT NOT NULL DEFAULT '[]', -- JSON array of user ids
    status            TEXT NOT NULL,              -- sending/queued/failed/...
    retry_count       INTEGER NOT NULL DEFAULT 0,
    is_optimistic     INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    is_offline_origin INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    failure_reason    TEXT
);

CREATE INDEX IF NOT EXISTS idx_ledger_conversation
    ON ledger_messages(conversation_id, client_timestamp);

-- ----------------------------------------------------------------
-- Offline queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS queue_entries (
    id                TEXT PRIMARY KEY NOT NULL,
    provisional_id    TEXT,
    conversation_id   TEXT NOT NULL,
    sender_id         TEXT NOT NULL,
    text              TEXT NOT NULL,
    client_timestamp  TEXT NOT NULL,
    server_timestamp  TEXT,
    read_by           TEXT NOT NULL DEFAULT '[]',
    status            TEXT NOT NULL,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    is_optimistic     INTEGER NOT NULL DEFAULT 1,
    is_offline_origin INTEGER NOT NULL DEFAULT 1,
    failure_reason    TEXT,
    queued_at         TEXT NOT NULL,
    last_attempt_at   TEXT,
    sequence          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_order
    ON queue_entries(queued_at, sequence);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
