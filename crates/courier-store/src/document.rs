//! The durable document store seam.
//!
//! Everything above this crate talks to storage through [`DocumentStore`].
//! Implementations must make `add_delivered`, `add_read` and
//! `set_reaction` atomic with respect to concurrent callers, and must
//! publish a fresh snapshot to [`Subscription`]s after every write to a
//! conversation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use courier_shared::{Conversation, ConversationId, Identity, MessageRecord, NewMessage, UserId};

use crate::error::Result;

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Persist a new message under a store-assigned id. The sender is
    /// recorded as delivered and the conversation preview is refreshed.
    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord>;

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>>;

    /// Latest `limit` messages, oldest first.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    /// Set-union `user` into the delivered set. Returns `false` when the
    /// message is not stored under `conversation_id`; nothing is written then.
    async fn add_delivered(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
    ) -> Result<bool>;

    /// Set-union `user` into the read (and delivered) sets of each message.
    /// Returns the ids that belong to `conversation_id`; others are skipped.
    async fn add_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[String],
        user: &UserId,
    ) -> Result<Vec<String>>;

    /// Replace or clear `user`'s single reaction. Returns the updated
    /// record, or `None` when the message is not stored under
    /// `conversation_id`.
    async fn set_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        user: &UserId,
        emoji: Option<&str>,
    ) -> Result<Option<MessageRecord>>;

    async fn get_profile(&self, user: &UserId) -> Result<Option<Identity>>;

    async fn put_profile(&self, profile: &Identity) -> Result<()>;

    /// Stream of conversation snapshots: the current one first, then one
    /// after every write to the conversation.
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription>;
}

// ---------------------------------------------------------------------------
// Snapshot subscriptions
// ---------------------------------------------------------------------------

const CHANNEL_CAPACITY: usize = 16;

/// Ordered snapshot stream for one conversation.
pub struct Subscription {
    conversation_id: ConversationId,
    initial: Option<Vec<MessageRecord>>,
    rx: broadcast::Receiver<Vec<MessageRecord>>,
}

impl Subscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Next snapshot, or `None` once the store has gone away.
    ///
    /// Snapshots are complete views, so a lagging subscriber skips to the
    /// newest one instead of replaying the backlog.
    pub async fn next(&mut self) -> Option<Vec<MessageRecord>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        conversation = %self.conversation_id,
                        skipped,
                        "snapshot subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Per-conversation fan-out of snapshots to subscribers.
#[derive(Clone, Default)]
pub struct SnapshotHub {
    channels: Arc<Mutex<HashMap<ConversationId, broadcast::Sender<Vec<MessageRecord>>>>>,
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with an initial snapshot the caller read while
    /// holding its own write lock.
    pub fn subscribe(
        &self,
        conversation_id: &ConversationId,
        initial: Vec<MessageRecord>,
    ) -> Subscription {
        let rx = {
            let mut channels = self.lock();
            channels
                .entry(conversation_id.clone())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        Subscription {
            conversation_id: conversation_id.clone(),
            initial: Some(initial),
            rx,
        }
    }

    /// Register a receiver before loading the initial snapshot, for stores
    /// that cannot hold a lock across the load.
    pub fn receiver(&self, conversation_id: &ConversationId) -> broadcast::Receiver<Vec<MessageRecord>> {
        let mut channels = self.lock();
        channels
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Build a subscription from a receiver obtained by [`Self::receiver`].
    pub fn attach(
        conversation_id: &ConversationId,
        rx: broadcast::Receiver<Vec<MessageRecord>>,
        initial: Vec<MessageRecord>,
    ) -> Subscription {
        Subscription {
            conversation_id: conversation_id.clone(),
            initial: Some(initial),
            rx,
        }
    }

    pub fn has_subscribers(&self, conversation_id: &ConversationId) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    pub fn publish(&self, conversation_id: &ConversationId, snapshot: Vec<MessageRecord>) {
        let mut channels = self.lock();
        if let Some(tx) = channels.get(conversation_id) {
            if tx.send(snapshot).is_err() {
                // Last subscriber is gone.
                channels.remove(conversation_id);
            }
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ConversationId, broadcast::Sender<Vec<MessageRecord>>>>
    {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
