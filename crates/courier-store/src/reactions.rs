use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rusqlite::params;

use courier_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Set or clear `user`'s reaction on a message. The (message, user)
    /// primary key keeps one reaction per user; the replace is atomic.
    ///
    /// Returns `false` when the message does not exist in `conversation_id`.
    pub fn set_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
        emoji: Option<&str>,
    ) -> Result<bool> {
        if !self.message_in_conversation(conversation_id, message_id)? {
            return Ok(false);
        }

        match emoji.filter(|e| !e.is_empty()) {
            Some(emoji) => {
                self.conn().execute(
                    "INSERT OR REPLACE INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![message_id, user.as_str(), emoji, Utc::now().timestamp_millis()],
                )?;
            }
            None => {
                self.conn().execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id, user.as_str()],
                )?;
            }
        }
        Ok(true)
    }

    pub fn reactions_for_message(&self, message_id: &str) -> Result<BTreeMap<String, BTreeSet<UserId>>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM reactions WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut reactions: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
        for row in rows {
            let (emoji, user) = row?;
            reactions.entry(emoji).or_default().insert(UserId::new(user));
        }
        Ok(reactions)
    }
}
