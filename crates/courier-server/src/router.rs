//! Message send, receipts and reactions.
//!
//! Every operation is delivered in real time even when the durable store
//! is degraded; the store is the record, not the transport.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use courier_shared::constants::TEMP_ID_PREFIX;
use courier_shared::message::is_temporary_id;
use courier_shared::protocol::{
    DeliveredPayload, DeliveryReceipt, MessageBroadcast, MessageSent, ReactPayload, ReactionUpdate,
    ReadPayload, ReadReceipt, SendAck, SendMessagePayload, SenderInfo, ServerEvent, SuccessAck,
};
use courier_shared::{ConversationId, NewMessage, Room, UserId};
use courier_store::{DocumentStore, StoreError};

use crate::error::GatewayError;
use crate::fanout::FanOut;
use crate::membership::MembershipGate;
use crate::policy::{on_store_error, FailurePolicy, Operation};
use crate::rate_limit::RateLimiter;
use crate::rooms::{ConnectionInfo, RoomRegistry};

/// Id for a message the store refused: `tmp_{millis}_{random}`.
pub fn temp_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{TEMP_ID_PREFIX}{}_{suffix}", Utc::now().timestamp_millis())
}

#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn DocumentStore>,
    gate: MembershipGate,
    rate_limiter: RateLimiter,
    fanout: Arc<dyn FanOut>,
    rooms: RoomRegistry,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gate: MembershipGate,
        rate_limiter: RateLimiter,
        fanout: Arc<dyn FanOut>,
        rooms: RoomRegistry,
    ) -> Self {
        Self {
            store,
            gate,
            rate_limiter,
            fanout,
            rooms,
        }
    }

    pub async fn send(
        &self,
        conn: &ConnectionInfo,
        payload: SendMessagePayload,
    ) -> Result<SendAck, GatewayError> {
        let user = conn.user_id();

        // 1. validate
        let conversation_id = payload
            .conversation_id
            .as_ref()
            .filter(|id| !id.as_str().trim().is_empty())
            .map(ConversationId::normalize)
            .ok_or_else(|| GatewayError::Validation("Invalid message data".into()))?;
        let kind = payload
            .kind
            .ok_or_else(|| GatewayError::Validation("Invalid message data".into()))?;

        // 2. rate gate
        if !self.rate_limiter.check(user).await {
            return Err(GatewayError::RateLimited);
        }

        // 3. membership gate
        if !self.gate.is_member(user, &conversation_id).await {
            return Err(GatewayError::NotMember);
        }

        // 4. persist, or fall back to a temporary id
        let message = NewMessage {
            conversation_id: conversation_id.clone(),
            sender_id: user.clone(),
            kind,
            text: payload.text,
            nonce: payload.nonce,
            sender_text: payload.sender_text,
            sender_nonce: payload.sender_nonce,
            reply_to: payload.reply_to,
            metadata: payload.metadata.unwrap_or_default(),
            client_id: payload.client_id,
            timestamp: Utc::now(),
        };
        let record = match self.store.append_message(message.clone()).await {
            Ok(record) => record,
            Err(e) => {
                self.tolerate(Operation::AppendMessage, e, user, &conversation_id)?;
                message.into_record(temp_message_id())
            }
        };

        // 5 + 6. broadcast to the conversation room and every member's room
        let rooms = self.rooms_for(&conversation_id, user).await;
        let reached = self
            .fanout
            .emit(
                &rooms,
                ServerEvent::NewMessage(MessageBroadcast {
                    message: record.clone(),
                    sender: SenderInfo::from(&conn.identity),
                }),
                None,
            )
            .await;

        info!(
            user = %user,
            conversation = %conversation_id,
            message = %record.id,
            temporary = record.is_temporary(),
            reached,
            "message routed"
        );

        // 7. confirm to the sending connection
        let timestamp = record.timestamp.timestamp_millis();
        self.rooms
            .send_to(
                &conn.id,
                ServerEvent::MessageSent(MessageSent {
                    message_id: record.id.clone(),
                    conversation_id,
                    timestamp,
                    client_id: record.client_id.clone(),
                })
                .into(),
            )
            .await;

        Ok(SendAck {
            success: true,
            message_id: record.id,
            timestamp,
        })
    }

    pub async fn delivered(
        &self,
        conn: &ConnectionInfo,
        payload: DeliveredPayload,
    ) -> Result<SuccessAck, GatewayError> {
        let user = conn.user_id();
        let conversation_id = payload.conversation_id.normalize();
        if payload.message_id.is_empty() {
            return Err(GatewayError::Validation("Missing message id".into()));
        }
        if !self.gate.is_member(user, &conversation_id).await {
            return Err(GatewayError::NotMember);
        }

        if !is_temporary_id(&payload.message_id) {
            match self
                .store
                .add_delivered(&conversation_id, &payload.message_id, user)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message = %payload.message_id, conversation = %conversation_id, "receipt for message outside conversation");
                    return Ok(SuccessAck { success: true });
                }
                Err(e) => self.tolerate(Operation::Receipt, e, user, &conversation_id)?,
            }
        }

        let rooms = self.rooms_for(&conversation_id, user).await;
        self.fanout
            .emit(
                &rooms,
                ServerEvent::Delivered(DeliveryReceipt {
                    message_id: payload.message_id,
                    user_id: user.clone(),
                    conversation_id,
                }),
                None,
            )
            .await;
        Ok(SuccessAck { success: true })
    }

    pub async fn read(
        &self,
        conn: &ConnectionInfo,
        payload: ReadPayload,
    ) -> Result<SuccessAck, GatewayError> {
        let user = conn.user_id();
        let conversation_id = payload.conversation_id.normalize();
        let mut message_ids: Vec<String> = payload
            .message_ids
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect();
        if message_ids.is_empty() {
            return Ok(SuccessAck { success: true });
        }

        if !self.gate.is_member(user, &conversation_id).await {
            return Err(GatewayError::NotMember);
        }

        let durable: Vec<String> = message_ids
            .iter()
            .filter(|id| !is_temporary_id(id))
            .cloned()
            .collect();
        if !durable.is_empty() {
            match self.store.add_read(&conversation_id, &durable, user).await {
                Ok(matched) => {
                    let matched: HashSet<String> = matched.into_iter().collect();
                    message_ids.retain(|id| is_temporary_id(id) || matched.contains(id));
                }
                Err(e) => self.tolerate(Operation::Receipt, e, user, &conversation_id)?,
            }
        }
        if message_ids.is_empty() {
            debug!(user = %user, conversation = %conversation_id, "no read message belongs to conversation");
            return Ok(SuccessAck { success: true });
        }

        debug!(user = %user, conversation = %conversation_id, count = message_ids.len(), "messages read");
        let rooms = self.rooms_for(&conversation_id, user).await;
        self.fanout
            .emit(
                &rooms,
                ServerEvent::Read(ReadReceipt {
                    conversation_id,
                    message_ids,
                    user_id: user.clone(),
                }),
                None,
            )
            .await;
        Ok(SuccessAck { success: true })
    }

    pub async fn react(
        &self,
        conn: &ConnectionInfo,
        payload: ReactPayload,
    ) -> Result<SuccessAck, GatewayError> {
        let user = conn.user_id();
        let conversation_id = payload.conversation_id.normalize();
        if payload.message_id.is_empty() {
            return Err(GatewayError::Validation("Missing message id".into()));
        }
        if !self.gate.is_member(user, &conversation_id).await {
            return Err(GatewayError::NotMember);
        }

        let emoji = payload.emoji.filter(|e| !e.is_empty());
        let reactions = if is_temporary_id(&payload.message_id) {
            None
        } else {
            match self
                .store
                .set_reaction(&conversation_id, &payload.message_id, user, emoji.as_deref())
                .await
            {
                Ok(Some(record)) => Some(record.reactions),
                Ok(None) => {
                    debug!(message = %payload.message_id, conversation = %conversation_id, "reaction on message outside conversation");
                    return Ok(SuccessAck { success: true });
                }
                Err(e) => {
                    self.tolerate(Operation::Reaction, e, user, &conversation_id)?;
                    None
                }
            }
        };

        let rooms = self.rooms_for(&conversation_id, user).await;
        self.fanout
            .emit(
                &rooms,
                ServerEvent::Reaction(ReactionUpdate {
                    conversation_id,
                    message_id: payload.message_id,
                    user_id: user.clone(),
                    emoji,
                    reactions,
                }),
                None,
            )
            .await;
        Ok(SuccessAck { success: true })
    }

    async fn rooms_for(&self, conversation_id: &ConversationId, sender: &UserId) -> Vec<Room> {
        let members = self.gate.fanout_members(conversation_id, sender).await;
        let mut rooms = Vec::with_capacity(members.len() + 1);
        rooms.push(Room::conversation(conversation_id));
        rooms.extend(members.into_iter().map(Room::User));
        rooms
    }

    /// Apply the failure policy to a store write error: degraded errors
    /// are logged and swallowed, anything else goes back to the client.
    fn tolerate(
        &self,
        op: Operation,
        err: StoreError,
        user: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<(), GatewayError> {
        match on_store_error(op, &err) {
            FailurePolicy::Degrade | FailurePolicy::FailOpen => {
                warn!(
                    user = %user,
                    conversation = %conversation_id,
                    operation = ?op,
                    error = %err,
                    "store degraded, continuing in real time"
                );
                Ok(())
            }
            FailurePolicy::Propagate | FailurePolicy::FailClosed => {
                Err(GatewayError::StoreFailure(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{connect, test_state};
    use courier_shared::protocol::{ClientEvent, ErrorCode, ServerFrame};
    use courier_shared::{Conversation, MessageKind};
    use courier_store::{Fault, MemoryStore};

    fn send_payload(conversation: &str, text: &str) -> SendMessagePayload {
        SendMessagePayload {
            conversation_id: Some(conversation.into()),
            kind: Some(MessageKind::Text),
            text: text.into(),
            nonce: Some("nonce".into()),
            sender_text: Some("own".into()),
            sender_nonce: Some("own-nonce".into()),
            client_id: Some("local_1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_temp_message_id_shape() {
        let id = temp_message_id();
        assert!(is_temporary_id(&id));
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let state = test_state(MemoryStore::new());
        let alice = connect(&state, "alice").await;

        let mut payload = send_payload("direct_alice_bob", "hi");
        payload.kind = None;
        let err = state.router.send(&alice.info, payload).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let mut payload = send_payload("", "hi");
        payload.conversation_id = Some("  ".into());
        let err = state.router.send(&alice.info, payload).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_send_rejects_non_member() {
        let store = MemoryStore::new();
        store
            .put_conversation(&Conversation::group(
                "g1".into(),
                "Deals",
                &"owner".into(),
                Vec::new(),
            ))
            .await
            .unwrap();
        let state = test_state(store);
        let mallory = connect(&state, "mallory").await;

        let err = state
            .router
            .send(&mallory.info, send_payload("g1", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotMember);
    }

    #[tokio::test]
    async fn test_rate_limit_on_61st_send() {
        let state = test_state(MemoryStore::new());
        let alice = connect(&state, "alice").await;

        for _ in 0..60 {
            state
                .router
                .send(&alice.info, send_payload("direct_alice_bob", "hi"))
                .await
                .unwrap();
        }
        let err = state
            .router
            .send(&alice.info, send_payload("direct_alice_bob", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn test_permission_denied_falls_back_to_temp_id() {
        let store = MemoryStore::new();
        let state = test_state(store.clone());
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;
        alice.frames().await;
        bob.frames().await;

        store.set_fault(Some(Fault::PermissionDenied)).await;
        let ack = state
            .router
            .send(&alice.info, send_payload("direct_bob_alice", "hi"))
            .await
            .unwrap();
        assert!(ack.success);
        assert!(ack.message_id.starts_with("tmp_"));

        let received: Vec<_> = bob
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::NewMessage(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.id, ack.message_id);
        assert_eq!(received[0].message.conversation_id.as_str(), "direct_alice_bob");

        let alice_events = alice.events().await;
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent(s) if s.message_id == ack.message_id)));
        assert!(!alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageError(_))));
    }

    #[tokio::test]
    async fn test_write_errors_degrade_or_propagate() {
        let state = test_state(MemoryStore::new());
        let user = UserId::from("alice");
        let conv = ConversationId::from("direct_alice_bob");

        assert!(state
            .router
            .tolerate(
                Operation::AppendMessage,
                StoreError::PermissionDenied("rules".into()),
                &user,
                &conv
            )
            .is_ok());
        let err = state
            .router
            .tolerate(Operation::Receipt, StoreError::NotFound, &user, &conv)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreFailure);
    }

    #[tokio::test]
    async fn test_receipts_and_reaction_broadcast() {
        let store = MemoryStore::new();
        let state = test_state(store.clone());
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;

        let ack = state
            .router
            .send(&alice.info, send_payload("direct_alice_bob", "hi"))
            .await
            .unwrap();
        alice.frames().await;
        bob.frames().await;

        bob.send(
            ClientEvent::Delivered(DeliveredPayload {
                message_id: ack.message_id.clone(),
                conversation_id: "direct_bob_alice".into(),
            }),
            None,
        )
        .await;
        bob.send(
            ClientEvent::Read(ReadPayload {
                conversation_id: "direct_alice_bob".into(),
                message_ids: vec![ack.message_id.clone()],
            }),
            Some(2),
        )
        .await;
        bob.send(
            ClientEvent::React(ReactPayload {
                conversation_id: "direct_alice_bob".into(),
                message_id: ack.message_id.clone(),
                emoji: Some("👍".into()),
            }),
            None,
        )
        .await;

        let events = alice.events().await;
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Delivered(r) if r.user_id.as_str() == "bob")));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Read(r) if r.message_ids == vec![ack.message_id.clone()])));
        let reaction = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::Reaction(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reaction.reactions.unwrap()["👍"].len(), 1);

        let stored = store.get_message(&ack.message_id).await.unwrap().unwrap();
        assert!(stored.read.contains(&UserId::from("bob")));
        assert!(stored.delivered.contains(&UserId::from("bob")));

        let bob_frames = bob.frames().await;
        assert!(bob_frames
            .iter()
            .any(|f| matches!(f, ServerFrame::Ack(a) if a.ack == 2 && a.error.is_none())));
    }

    async fn seeded_group(store: &MemoryStore) -> String {
        store
            .put_conversation(&Conversation::group(
                "g1".into(),
                "Deals",
                &"owner".into(),
                vec!["m1".into()],
            ))
            .await
            .unwrap();
        let mut payload = send_payload("g1", "deal");
        payload.nonce = None;
        let state = test_state(store.clone());
        let owner = connect(&state, "owner").await;
        state.router.send(&owner.info, payload).await.unwrap().message_id
    }

    #[tokio::test]
    async fn test_receipts_and_reactions_stay_in_their_conversation() {
        let store = MemoryStore::new();
        let message_id = seeded_group(&store).await;

        let state = test_state(store.clone());
        let mut owner = connect(&state, "owner").await;
        let mut mallory = connect(&state, "mallory").await;
        owner.frames().await;
        mallory.frames().await;

        let elsewhere = ConversationId::from("direct_mallory_zed");
        let react = state
            .router
            .react(
                &mallory.info,
                ReactPayload {
                    conversation_id: elsewhere.clone(),
                    message_id: message_id.clone(),
                    emoji: Some("💩".into()),
                },
            )
            .await
            .unwrap();
        assert!(react.success);
        state
            .router
            .read(
                &mallory.info,
                ReadPayload {
                    conversation_id: elsewhere.clone(),
                    message_ids: vec![message_id.clone()],
                },
            )
            .await
            .unwrap();
        state
            .router
            .delivered(
                &mallory.info,
                DeliveredPayload {
                    message_id: message_id.clone(),
                    conversation_id: elsewhere,
                },
            )
            .await
            .unwrap();

        let stored = store.get_message(&message_id).await.unwrap().unwrap();
        let mallory_id = UserId::from("mallory");
        assert!(stored.reactions.is_empty());
        assert!(!stored.read.contains(&mallory_id));
        assert!(!stored.delivered.contains(&mallory_id));

        assert!(mallory.events().await.is_empty());
        assert!(owner.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_delivered_requires_membership() {
        let store = MemoryStore::new();
        let message_id = seeded_group(&store).await;
        let state = test_state(store);
        let mallory = connect(&state, "mallory").await;

        let err = state
            .router
            .delivered(
                &mallory.info,
                DeliveredPayload {
                    message_id,
                    conversation_id: "g1".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotMember);
    }

    #[tokio::test]
    async fn test_delivered_reaches_owner_with_cold_member_cache() {
        let store = MemoryStore::new();
        let message_id = seeded_group(&store).await;

        let state = test_state(store);
        let mut owner = connect(&state, "owner").await;
        let mut m1 = connect(&state, "m1").await;
        owner.frames().await;
        m1.frames().await;

        state
            .router
            .delivered(
                &m1.info,
                DeliveredPayload {
                    message_id: message_id.clone(),
                    conversation_id: "g1".into(),
                },
            )
            .await
            .unwrap();

        let events = owner.events().await;
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::Delivered(r) if r.message_id == message_id && r.user_id.as_str() == "m1"
        )));
    }
}
