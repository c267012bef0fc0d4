//! The message record shared by the store, the router and the client.
//!
//! Receipt sets only ever grow and each user holds at most one reaction
//! per message. Every mutation in this module preserves both rules, so
//! the store and the client apply exactly the same semantics.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{LOCAL_ID_PREFIX, TEMP_ID_PREFIX};
use crate::types::{ConversationId, UserId};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Voice => "voice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "voice" => Some(MessageKind::Voice),
            _ => None,
        }
    }
}

/// Free-form attachment details.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Voice note length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Download URL handed out by the blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
}

/// A message before the store assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub text: String,
    pub nonce: Option<String>,
    pub sender_text: Option<String>,
    pub sender_nonce: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: MessageMetadata,
    pub client_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    /// Materialize the record under `id`. The sender counts as having
    /// received their own message.
    pub fn into_record(self, id: String) -> MessageRecord {
        let delivered = [self.sender_id.clone()].into_iter().collect();
        MessageRecord {
            id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind,
            text: self.text,
            nonce: self.nonce,
            sender_text: self.sender_text,
            sender_nonce: self.sender_nonce,
            timestamp: self.timestamp,
            delivered,
            read: BTreeSet::new(),
            reactions: BTreeMap::new(),
            reply_to: self.reply_to,
            metadata: self.metadata,
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Body, encrypted for the recipient when `nonce` is set.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Same plaintext encrypted under the sender's own key.
    #[serde(default)]
    pub sender_text: Option<String>,
    #[serde(default)]
    pub sender_nonce: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivered: BTreeSet<UserId>,
    #[serde(default)]
    pub read: BTreeSet<UserId>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// The sender's temporary id, echoed back for reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessageRecord {
    /// Whether the id was made up locally or by a degraded server.
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }

    pub fn is_encrypted(&self) -> bool {
        self.nonce.is_some()
    }

    /// Returns `true` if `user` was not yet in the delivered set.
    pub fn mark_delivered(&mut self, user: &UserId) -> bool {
        self.delivered.insert(user.clone())
    }

    /// Mark read. The reader is also recorded as delivered so that
    /// `read` stays a subset of `delivered`.
    pub fn mark_read(&mut self, user: &UserId) -> bool {
        self.delivered.insert(user.clone());
        self.read.insert(user.clone())
    }

    /// Union the receipts of `other` into this record.
    pub fn merge_receipts(&mut self, other: &MessageRecord) {
        self.delivered.extend(other.delivered.iter().cloned());
        self.read.extend(other.read.iter().cloned());
        self.delivered.extend(other.read.iter().cloned());
    }

    /// Set `user`'s reaction to `emoji`, or clear it with `None`.
    ///
    /// The user is removed from every other emoji first; emptied emoji
    /// entries are dropped.
    pub fn apply_reaction(&mut self, user: &UserId, emoji: Option<&str>) {
        for users in self.reactions.values_mut() {
            users.remove(user);
        }
        self.reactions.retain(|_, users| !users.is_empty());
        if let Some(emoji) = emoji.filter(|e| !e.is_empty()) {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user.clone());
        }
    }

    pub fn reaction_of(&self, user: &UserId) -> Option<&str> {
        self.reactions
            .iter()
            .find(|(_, users)| users.contains(user))
            .map(|(emoji, _)| emoji.as_str())
    }

    /// Short text for the conversation list.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text if self.is_encrypted() => "🔒 Message".to_string(),
            MessageKind::Text => self.text.chars().take(100).collect(),
            MessageKind::Image => "📷 Photo".to_string(),
            MessageKind::File => format!(
                "📎 {}",
                self.metadata.file_name.as_deref().unwrap_or("File")
            ),
            MessageKind::Voice => "🎤 Voice message".to_string(),
        }
    }
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX) || id.starts_with(LOCAL_ID_PREFIX)
}

/// Ids minted by a client for its own unacknowledged sends. Unlike server
/// `tmp_` ids, no other participant ever sees them.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}
