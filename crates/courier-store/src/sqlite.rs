//! [`DocumentStore`] over SQLite.
//!
//! `rusqlite` is synchronous, so every call runs on the blocking pool
//! against a connection guarded by a mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use courier_shared::constants::SNAPSHOT_LIMIT;
use courier_shared::{Conversation, ConversationId, Identity, MessageRecord, NewMessage, UserId};

use crate::database::Database;
use crate::document::{DocumentStore, SnapshotHub, Subscription};
use crate::error::{Result, StoreError};
use crate::receipts::ReceiptKind;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
    hub: SnapshotHub,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            hub: SnapshotHub::new(),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new()?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database mutex poisoned".into()))?;
            f(&guard)
        })
        .await?
    }

    /// Push the current view of `conversation_id` to its subscribers.
    async fn notify(&self, conversation_id: &ConversationId) {
        if !self.hub.has_subscribers(conversation_id) {
            return;
        }
        let id = conversation_id.clone();
        match self
            .with_db(move |db| db.list_messages(&id, SNAPSHOT_LIMIT))
            .await
        {
            Ok(snapshot) => self.hub.publish(conversation_id, snapshot),
            Err(e) => tracing::warn!(
                conversation = %conversation_id,
                error = %e,
                "failed to load snapshot for subscribers"
            ),
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let id = id.clone();
        self.with_db(move |db| db.get_conversation(&id)).await
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.with_db(move |db| db.upsert_conversation(&conversation))
            .await
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let conversation_id = message.conversation_id.clone();
        let record = message.into_record(Uuid::new_v4().to_string());
        let stored = record.clone();
        self.with_db(move |db| db.insert_message(&stored)).await?;

        tracing::debug!(
            conversation = %conversation_id,
            message = %record.id,
            "message appended"
        );
        self.notify(&conversation_id).await;
        Ok(record)
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let id = id.to_string();
        self.with_db(move |db| db.get_message(&id)).await
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let id = conversation_id.clone();
        self.with_db(move |db| db.list_messages(&id, limit)).await
    }

    async fn add_delivered(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
    ) -> Result<bool> {
        let conv = conversation_id.clone();
        let (message_id, user) = (message_id.to_string(), user.clone());
        let (found, grew) = self
            .with_db(move |db| {
                if !db.message_in_conversation(&conv, &message_id)? {
                    return Ok((false, false));
                }
                let grew = db.add_receipt(&conv, &message_id, &user, ReceiptKind::Delivered)?;
                Ok((true, grew))
            })
            .await?;
        if grew {
            self.notify(conversation_id).await;
        }
        Ok(found)
    }

    async fn add_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[String],
        user: &UserId,
    ) -> Result<Vec<String>> {
        let conv = conversation_id.clone();
        let (message_ids, user) = (message_ids.to_vec(), user.clone());
        let matched = self
            .with_db(move |db| db.mark_read(&conv, &message_ids, &user))
            .await?;
        if !matched.is_empty() {
            self.notify(conversation_id).await;
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
        let conv = conversation_id.clone();
        let (message_id, user) = (message_id.to_string(), user.clone());
        let emoji = emoji.map(str::to_string);
        let updated = self
            .with_db(move |db| {
                if db.set_reaction(&conv, &message_id, &user, emoji.as_deref())? {
                    db.get_message(&message_id)
                } else {
                    Ok(None)
                }
            })
            .await?;
        if updated.is_some() {
            self.notify(conversation_id).await;
        }
        Ok(updated)
    }

    async fn get_profile(&self, user: &UserId) -> Result<Option<Identity>> {
        let user = user.clone();
        self.with_db(move |db| db.get_profile(&user)).await
    }

    async fn put_profile(&self, profile: &Identity) -> Result<()> {
        let profile = profile.clone();
        self.with_db(move |db| db.upsert_profile(&profile)).await
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription> {
        let rx = self.hub.receiver(conversation_id);
        let initial = self.list_messages(conversation_id, SNAPSHOT_LIMIT).await?;
        Ok(SnapshotHub::attach(conversation_id, rx, initial))
    }
}
