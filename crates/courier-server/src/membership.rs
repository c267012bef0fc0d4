//! Membership checks against the durable store.
//!
//! Degraded stores fail open so messaging keeps working through a store
//! outage; every other store error fails closed. The member list of each
//! conversation fetched successfully is cached and used to fan out while
//! the store is degraded.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use courier_shared::{ConversationId, UserId};
use courier_store::DocumentStore;

use crate::policy::{on_store_error, FailurePolicy, Operation};

#[derive(Clone)]
pub struct MembershipGate {
    store: Arc<dyn DocumentStore>,
    known_members: Arc<RwLock<HashMap<ConversationId, BTreeSet<UserId>>>>,
}

impl MembershipGate {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            known_members: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether `user` may act in `conversation_id` (already normalized).
    pub async fn is_member(&self, user: &UserId, conversation_id: &ConversationId) -> bool {
        match self.store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => {
                let allowed = conversation.is_member(user);
                self.known_members
                    .write()
                    .await
                    .insert(conversation_id.clone(), conversation.members);
                allowed
            }
            Ok(None) => match conversation_id.direct_members() {
                Some((a, b)) => &a == user || &b == user,
                None => false,
            },
            Err(e) => match on_store_error(Operation::MembershipCheck, &e) {
                FailurePolicy::FailOpen => {
                    warn!(
                        user = %user,
                        conversation = %conversation_id,
                        error = %e,
                        "store degraded, allowing membership"
                    );
                    true
                }
                _ => {
                    error!(
                        user = %user,
                        conversation = %conversation_id,
                        error = %e,
                        "membership check failed"
                    );
                    false
                }
            },
        }
    }

    /// Best-known members of a conversation without touching the store:
    /// the cached list, else the pair encoded in a direct id, else empty.
    pub async fn known_members(&self, conversation_id: &ConversationId) -> BTreeSet<UserId> {
        if let Some(members) = self.known_members.read().await.get(conversation_id) {
            return members.clone();
        }
        match conversation_id.direct_members() {
            Some((a, b)) => [a, b].into_iter().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Recipients for a fan-out of `sender`'s message. Never empty: with
    /// nothing better known, the sender alone.
    ///
    /// A cache miss reads the conversation from the store; only when that
    /// read fails or finds nothing does it fall back to `known_members`.
    pub async fn fanout_members(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
    ) -> BTreeSet<UserId> {
        let cached = self.known_members.read().await.get(conversation_id).cloned();
        let mut members = match cached {
            Some(members) => members,
            None => match self.store.get_conversation(conversation_id).await {
                Ok(Some(conversation)) => {
                    self.known_members
                        .write()
                        .await
                        .insert(conversation_id.clone(), conversation.members.clone());
                    conversation.members
                }
                Ok(None) => self.known_members(conversation_id).await,
                Err(e) => {
                    debug!(conversation = %conversation_id, error = %e, "member lookup failed, using known members");
                    self.known_members(conversation_id).await
                }
            },
        };
        if members.is_empty() {
            members.insert(sender.clone());
        }
        members
    }
}
