//! In-process [`DocumentStore`].
//!
//! Holds everything in maps behind one lock, so every operation is atomic.
//! A [`Fault`] can be injected to make every call fail the way a degraded
//! or broken backend would.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_shared::constants::SNAPSHOT_LIMIT;
use courier_shared::{
    Conversation, ConversationId, Identity, LastMessage, MessageRecord, NewMessage, UserId,
};

use crate::document::{DocumentStore, SnapshotHub, Subscription};
use crate::error::{Result, StoreError};

/// Failure mode injected into a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    PermissionDenied,
    Unavailable,
    /// A non-degraded failure.
    Internal,
}

impl Fault {
    fn to_error(self) -> StoreError {
        match self {
            Fault::PermissionDenied => {
                StoreError::PermissionDenied("missing or insufficient permissions".into())
            }
            Fault::Unavailable => StoreError::Unavailable("backend unreachable".into()),
            Fault::Internal => StoreError::Io(std::io::Error::other("injected store failure")),
        }
    }
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<String, MessageRecord>,
    profiles: HashMap<UserId, Identity>,
    fault: Option<Fault>,
}

impl Inner {
    fn check(&self) -> Result<()> {
        match self.fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn latest(&self, conversation_id: &ConversationId, limit: usize) -> Vec<MessageRecord> {
        let mut messages: Vec<MessageRecord> = self
            .messages
            .values()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let skip = messages.len().saturating_sub(limit);
        messages.split_off(skip)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    hub: SnapshotHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `fault`, or clear it with `None`.
    pub async fn set_fault(&self, fault: Option<Fault>) {
        self.inner.write().await.fault = fault;
    }

    fn notify(&self, inner: &Inner, conversation_id: &ConversationId) {
        if self.hub.has_subscribers(conversation_id) {
            self.hub
                .publish(conversation_id, inner.latest(conversation_id, SNAPSHOT_LIMIT));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(inner.conversations.get(id).cloned())
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let mut inner = self.inner.write().await;
        inner.check()?;

        let record = message.into_record(Uuid::new_v4().to_string());
        if let Some(conversation) = inner.conversations.get_mut(&record.conversation_id) {
            conversation.last_message = Some(LastMessage {
                text: record.preview(),
                sender_id: record.sender_id.clone(),
                timestamp: record.timestamp,
            });
        }
        inner.messages.insert(record.id.clone(), record.clone());
        self.notify(&inner, &record.conversation_id);
        Ok(record)
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(inner.messages.get(id).cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(inner.latest(conversation_id, limit))
    }

    async fn add_delivered(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        let Some(message) = inner
            .messages
            .get_mut(message_id)
            .filter(|m| &m.conversation_id == conversation_id)
        else {
            return Ok(false);
        };
        if message.mark_delivered(user) {
            self.notify(&inner, conversation_id);
        }
        Ok(true)
    }

    async fn add_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[String],
        user: &UserId,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        let mut grew = false;
        let mut matched = Vec::new();
        for id in message_ids {
            let Some(message) = inner
                .messages
                .get_mut(id)
                .filter(|m| &m.conversation_id == conversation_id)
            else {
                continue;
            };
            grew |= message.mark_read(user);
            matched.push(id.clone());
        }
        if grew {
            self.notify(&inner, conversation_id);
        }
        Ok(matched)
    }

    async fn set_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
        emoji: Option<&str>,
    ) -> Result<Option<MessageRecord>> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        let updated = inner
            .messages
            .get_mut(message_id)
            .filter(|m| &m.conversation_id == conversation_id)
            .map(|m| {
                m.apply_reaction(user, emoji);
                m.clone()
            });
        if updated.is_some() {
            self.notify(&inner, conversation_id);
        }
        Ok(updated)
    }

    async fn get_profile(&self, user: &UserId) -> Result<Option<Identity>> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(inner.profiles.get(user).cloned())
    }

    async fn put_profile(&self, profile: &Identity) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        inner.profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(self
            .hub
            .subscribe(conversation_id, inner.latest(conversation_id, SNAPSHOT_LIMIT)))
    }
}
