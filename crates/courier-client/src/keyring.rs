//! Encryption glue between the client view and the sealed-box primitives.
//!
//! Direct messages are sealed twice: for the recipient and for the
//! sender's own key. Group messages travel unsealed, and so do direct
//! messages whose peer key is unknown, with a warning. Failing to open
//! a body never surfaces as an error; the view shows a placeholder.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;
use x25519_dalek::PublicKey;

use courier_shared::constants::DECRYPTION_PLACEHOLDER;
use courier_shared::crypto::{open_text, seal, KeyPair};
use courier_shared::{ConversationId, MessageRecord, UserId};

use crate::error::ClientError;

/// Ciphertext fields of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedBody {
    pub text: String,
    pub nonce: Option<String>,
    pub sender_text: Option<String>,
    pub sender_nonce: Option<String>,
}

pub struct Keyring {
    user_id: UserId,
    own: KeyPair,
    peers: RwLock<HashMap<UserId, PublicKey>>,
}

impl Keyring {
    pub fn new(user_id: UserId, own: KeyPair) -> Self {
        Self {
            user_id,
            own,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.own.public_key()
    }

    pub fn register_peer(&self, user: UserId, key: PublicKey) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user, key);
    }

    fn peer_of(&self, conversation_id: &ConversationId) -> Option<UserId> {
        let (a, b) = conversation_id.direct_members()?;
        Some(if a == self.user_id { b } else { a })
    }

    fn peer_key(&self, peer: &UserId) -> Option<PublicKey> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
    }

    /// The other member of a direct conversation whose key is not
    /// registered yet. `None` for groups and for peers we can seal for.
    pub fn missing_peer_key(&self, conversation_id: &ConversationId) -> Option<UserId> {
        self.peer_of(conversation_id)
            .filter(|peer| self.peer_key(peer).is_none())
    }

    /// Seal `plaintext` for the other member of a direct conversation and
    /// for ourselves.
    pub fn seal_for(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
    ) -> Result<SealedBody, ClientError> {
        let recipient = self
            .peer_of(conversation_id)
            .map(|peer| self.peer_key(&peer).ok_or(peer));
        let recipient = match recipient {
            Some(Ok(key)) => key,
            missing => {
                if let Some(Err(peer)) = missing {
                    warn!(conversation = %conversation_id, peer = %peer, "peer key unknown, sending unsealed");
                }
                return Ok(SealedBody {
                    text: plaintext.to_string(),
                    ..Default::default()
                });
            }
        };
        let for_recipient = seal(plaintext.as_bytes(), &recipient)?;
        let for_self = seal(plaintext.as_bytes(), &self.own.public_key())?;
        Ok(SealedBody {
            text: for_recipient.ciphertext,
            nonce: Some(for_recipient.nonce),
            sender_text: Some(for_self.ciphertext),
            sender_nonce: Some(for_self.nonce),
        })
    }

    /// Text to display for `record`. The sender reads their own copy.
    pub fn display_text(&self, record: &MessageRecord) -> String {
        let Some(nonce) = record.nonce.as_deref() else {
            return record.text.clone();
        };
        let opened = if record.sender_id == self.user_id {
            match (record.sender_text.as_deref(), record.sender_nonce.as_deref()) {
                (Some(text), Some(nonce)) => open_text(text, nonce, &self.own).ok(),
                _ => None,
            }
        } else {
            open_text(&record.text, nonce, &self.own).ok()
        };
        opened.unwrap_or_else(|| {
            tracing::debug!(message = %record.id, "message body could not be opened");
            DECRYPTION_PLACEHOLDER.to_string()
        })
    }
}
