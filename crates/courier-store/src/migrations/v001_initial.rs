//! v001 -- Initial schema creation.
//!
//! Creates `conversations`, `messages`, `message_receipts` and `profiles`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT PRIMARY KEY NOT NULL,   -- direct_{a}_{b} or opaque group id
    kind         TEXT NOT NULL,               -- 'direct' | 'group'
    members      TEXT NOT NULL,               -- JSON array of user ids
    group_info   TEXT,                        -- JSON, groups only
    last_message TEXT,                        -- JSON preview, updated on append
    created_at   INTEGER NOT NULL             -- unix epoch ms
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    kind            TEXT NOT NULL,              -- text | image | file | voice
    text            TEXT NOT NULL,              -- recipient ciphertext
    nonce           TEXT,
    sender_text     TEXT,                       -- sender-key ciphertext
    sender_nonce    TEXT,
    timestamp       INTEGER NOT NULL,           -- unix epoch ms
    reply_to        TEXT,
    metadata        TEXT NOT NULL,              -- JSON
    client_id       TEXT                        -- sender's temporary id
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp DESC);

-- ----------------------------------------------------------------
-- Receipts (one row per message/user/kind, insert-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_receipts (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    kind       TEXT NOT NULL CHECK (kind IN ('delivered', 'read')),
    created_at INTEGER NOT NULL,

    PRIMARY KEY (message_id, user_id, kind),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Profiles
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    user_id      TEXT PRIMARY KEY NOT NULL,
    email        TEXT,
    display_name TEXT NOT NULL,
    photo_url    TEXT NOT NULL,
    tier         TEXT NOT NULL,
    updated_at   INTEGER NOT NULL
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        up(&conn).unwrap();
        up(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }
}
