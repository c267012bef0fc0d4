//! Delivery and read receipts.
//!
//! Receipts are insert-only rows keyed by (message, user, kind), so adding
//! one is an atomic set-union: concurrent writers cannot drop each other's
//! entries and a repeated write is a no-op.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::params;

use courier_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Delivered => "delivered",
            ReceiptKind::Read => "read",
        }
    }
}

impl Database {
    /// Whether `message_id` exists and belongs to `conversation_id`.
    pub fn message_in_conversation(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Result<bool> {
        let found = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2)",
            params![message_id, conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Add `user` to the receipt set of `message_id`. Returns `true` if the
    /// set grew. Messages outside `conversation_id` are ignored.
    pub fn add_receipt(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
        kind: ReceiptKind,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_receipts (message_id, user_id, kind, created_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?5)",
            params![
                message_id,
                user.as_str(),
                kind.as_str(),
                Utc::now().timestamp_millis(),
                conversation_id.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    /// Mark a batch as read by `user`. Read implies delivered.
    ///
    /// Returns the ids that belong to `conversation_id`; the rest are skipped.
    pub fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[String],
        user: &UserId,
    ) -> Result<Vec<String>> {
        let tx = self.conn().unchecked_transaction()?;
        let now = Utc::now().timestamp_millis();
        let mut matched = Vec::new();
        {
            let mut exists = tx.prepare(
                "SELECT EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2)",
            )?;
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO message_receipts (message_id, user_id, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for id in message_ids {
                let found: bool =
                    exists.query_row(params![id, conversation_id.as_str()], |row| row.get(0))?;
                if !found {
                    continue;
                }
                insert.execute(params![id, user.as_str(), ReceiptKind::Delivered.as_str(), now])?;
                insert.execute(params![id, user.as_str(), ReceiptKind::Read.as_str(), now])?;
                matched.push(id.clone());
            }
        }
        tx.commit()?;
        Ok(matched)
    }

    /// `(delivered, read)` sets of a message.
    pub fn receipts_for_message(
        &self,
        message_id: &str,
    ) -> Result<(BTreeSet<UserId>, BTreeSet<UserId>)> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id, kind FROM message_receipts WHERE message_id = ?1")?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut delivered = BTreeSet::new();
        let mut read = BTreeSet::new();
        for row in rows {
            let (user, kind) = row?;
            if kind == ReceiptKind::Read.as_str() {
                read.insert(UserId::new(user));
            } else {
                delivered.insert(UserId::new(user));
            }
        }
        Ok((delivered, read))
    }
}
