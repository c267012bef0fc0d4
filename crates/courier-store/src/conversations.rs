use rusqlite::{params, OptionalExtension};

use courier_shared::{Conversation, ConversationId, ConversationKind, LastMessage};

use crate::database::Database;
use crate::error::Result;
use crate::messages::from_millis;

impl Database {
    /// Insert or fully replace a conversation.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let members = serde_json::to_string(&conversation.members)?;
        let group_info = conversation
            .group_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_message = conversation
            .last_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO conversations (id, kind, members, group_info, last_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                members = excluded.members,
                group_info = excluded.group_info,
                last_message = excluded.last_message",
            params![
                conversation.id.as_str(),
                conversation.kind.as_str(),
                members,
                group_info,
                last_message,
                conversation.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                "SELECT kind, members, group_info, last_message, created_at
                 FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((kind, members, group_info, last_message, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Conversation {
            id: id.clone(),
            kind: if kind == "direct" {
                ConversationKind::Direct
            } else {
                ConversationKind::Group
            },
            members: serde_json::from_str(&members)?,
            group_info: group_info.as_deref().map(serde_json::from_str).transpose()?,
            last_message: last_message
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: from_millis(created_at),
        }))
    }

    /// Update the preview of an existing conversation. Returns `false` if
    /// the conversation does not exist.
    pub fn set_last_message(&self, id: &ConversationId, last: &LastMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET last_message = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(last)?],
        )?;
        Ok(affected > 0)
    }
}
