use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::{
    ConversationId, LastMessage, MessageKind, MessageMetadata, MessageRecord, UserId,
};

use crate::database::Database;
use crate::error::Result;

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

const SELECT_COLUMNS: &str = "id, conversation_id, sender_id, kind, text, nonce, sender_text,
     sender_nonce, timestamp, reply_to, metadata, client_id";

impl Database {
    /// Insert a message together with its initial receipts and refresh the
    /// conversation preview, in one transaction.
    pub fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, kind, text, nonce,
                                   sender_text, sender_nonce, timestamp, reply_to,
                                   metadata, client_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.conversation_id.as_str(),
                record.sender_id.as_str(),
                record.kind.as_str(),
                record.text,
                record.nonce,
                record.sender_text,
                record.sender_nonce,
                record.timestamp.timestamp_millis(),
                record.reply_to,
                serde_json::to_string(&record.metadata)?,
                record.client_id,
            ],
        )?;

        let now = Utc::now().timestamp_millis();
        for (kind, users) in [("delivered", &record.delivered), ("read", &record.read)] {
            for user in users {
                tx.execute(
                    "INSERT OR IGNORE INTO message_receipts (message_id, user_id, kind, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![record.id, user.as_str(), kind, now],
                )?;
            }
        }

        let last = LastMessage {
            text: record.preview(),
            sender_id: record.sender_id.clone(),
            timestamp: record.timestamp,
        };
        tx.execute(
            "UPDATE conversations SET last_message = ?2 WHERE id = ?1",
            params![record.conversation_id.as_str(), serde_json::to_string(&last)?],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                self.hydrate(&mut record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The latest `limit` messages of a conversation, oldest first.
    pub fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit as i64],
            row_to_record,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let mut record = row?;
            self.hydrate(&mut record)?;
            messages.push(record);
        }
        messages.reverse();
        Ok(messages)
    }

    fn hydrate(&self, record: &mut MessageRecord) -> Result<()> {
        let (delivered, read) = self.receipts_for_message(&record.id)?;
        record.delivered = delivered;
        record.read = read;
        record.reactions = self.reactions_for_message(&record.id)?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let kind_str: String = row.get(3)?;
    let kind = MessageKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown message kind: {kind_str}").into(),
        )
    })?;

    let metadata_str: String = row.get(10)?;
    let metadata: MessageMetadata = serde_json::from_str(&metadata_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        sender_id: UserId::new(row.get::<_, String>(2)?),
        kind,
        text: row.get(4)?,
        nonce: row.get(5)?,
        sender_text: row.get(6)?,
        sender_nonce: row.get(7)?,
        timestamp: from_millis(row.get(8)?),
        delivered: Default::default(),
        read: Default::default(),
        reactions: Default::default(),
        reply_to: row.get(9)?,
        metadata,
        client_id: row.get(11)?,
    })
}
