//! Per-connection event dispatch.
//!
//! A [`Session`] is owned by the socket reader task of one connection and
//! handles its client frames strictly in arrival order.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_shared::constants::SNAPSHOT_LIMIT;
use courier_shared::protocol::{
    AckFrame, ClientEvent, ClientFrame, ConversationSnapshot, ErrorPayload, JoinAck, ServerEvent,
    ServerFrame, SuccessAck, TypingCurrent,
};
use courier_shared::{ConversationId, Room};

use crate::error::GatewayError;
use crate::policy::{on_store_error, Operation};
use crate::rooms::ConnectionInfo;
use crate::state::AppState;
use crate::typing::Indicator;

pub struct Session {
    state: AppState,
    info: ConnectionInfo,
    forwarders: HashMap<ConversationId, JoinHandle<()>>,
}

/// Where an error for a frame without an ack is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorChannel {
    Message,
    Conversation,
}

impl Session {
    pub fn new(state: AppState, info: ConnectionInfo) -> Self {
        Self {
            state,
            info,
            forwarders: HashMap::new(),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Handle one raw text frame from the socket.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => {
                let channel = match e.event.as_deref() {
                    Some(name) if name.starts_with("conversation:") => ErrorChannel::Conversation,
                    _ => ErrorChannel::Message,
                };
                debug!(
                    connection = %self.info.id,
                    event = e.event.as_deref().unwrap_or("?"),
                    error = %e.error,
                    "undecodable frame"
                );
                let err = GatewayError::Validation(format!("Invalid event: {}", e.error));
                self.reply_error(e.ack, channel, &err).await;
            }
        }
    }

    pub async fn dispatch(&mut self, frame: ClientFrame) {
        let ClientFrame { event, ack } = frame;
        let name = event.name();
        let channel = match event {
            ClientEvent::Join(_) | ClientEvent::Leave(_) => ErrorChannel::Conversation,
            _ => ErrorChannel::Message,
        };

        let result = self.handle(event).await;
        match result {
            Ok(Some(data)) => {
                if let Some(ack) = ack {
                    self.send(ServerFrame::Ack(AckFrame { ack, error: None, data }))
                        .await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.log_error(name, &e);
                self.reply_error(ack, channel, &e).await;
            }
        }
    }

    /// Returns the ack payload, if the event has one.
    async fn handle(
        &mut self,
        event: ClientEvent,
    ) -> Result<Option<serde_json::Value>, GatewayError> {
        let router = self.state.router.clone();
        match event {
            ClientEvent::SendMessage(payload) => {
                let ack = router.send(&self.info, payload).await?;
                Ok(Some(to_value(&ack)))
            }
            ClientEvent::Delivered(payload) => {
                let ack = router.delivered(&self.info, payload).await?;
                Ok(Some(to_value(&ack)))
            }
            ClientEvent::Read(payload) => {
                let ack = router.read(&self.info, payload).await?;
                Ok(Some(to_value(&ack)))
            }
            ClientEvent::React(payload) => {
                let ack = router.react(&self.info, payload).await?;
                Ok(Some(to_value(&ack)))
            }
            ClientEvent::TypingStart(conv) => {
                self.indicator(Indicator::Typing, conv.id(), true).await;
                Ok(None)
            }
            ClientEvent::TypingStop(conv) => {
                self.indicator(Indicator::Typing, conv.id(), false).await;
                Ok(None)
            }
            ClientEvent::RecordingStart(conv) => {
                self.indicator(Indicator::Recording, conv.id(), true).await;
                Ok(None)
            }
            ClientEvent::RecordingStop(conv) => {
                self.indicator(Indicator::Recording, conv.id(), false).await;
                Ok(None)
            }
            ClientEvent::Join(conv) => {
                let ack = self.join(&conv).await?;
                Ok(Some(to_value(&ack)))
            }
            ClientEvent::Leave(conv) => {
                self.leave(&conv).await;
                Ok(Some(to_value(&SuccessAck { success: true })))
            }
        }
    }

    async fn indicator(&self, indicator: Indicator, conversation_id: &ConversationId, active: bool) {
        let conversation_id = conversation_id.normalize();
        let typing = &self.state.typing;
        if !active {
            typing
                .stop(indicator, self.info.id, self.info.user_id(), &conversation_id)
                .await;
            return;
        }
        if !self.state.gate.is_member(self.info.user_id(), &conversation_id).await {
            warn!(
                user = %self.info.user_id(),
                conversation = %conversation_id,
                indicator = indicator.as_str(),
                "indicator from non-member dropped"
            );
            return;
        }
        typing
            .start(indicator, self.info.id, &self.info.identity, &conversation_id)
            .await;
    }

    async fn join(&mut self, conversation_id: &ConversationId) -> Result<JoinAck, GatewayError> {
        let conversation_id = conversation_id.normalize();
        if conversation_id.as_str().trim().is_empty() {
            return Err(GatewayError::Validation("Missing conversation id".into()));
        }
        if !self.state.gate.is_member(self.info.user_id(), &conversation_id).await {
            return Err(GatewayError::NotMember);
        }

        let joined = self
            .state
            .rooms
            .join(&self.info.id, Room::conversation(&conversation_id))
            .await;
        if joined {
            info!(user = %self.info.user_id(), conversation = %conversation_id, "joined conversation");
        }

        let typing_users = self.state.typing.current(&conversation_id).await;
        self.send(
            ServerEvent::TypingCurrent(TypingCurrent {
                conversation_id: conversation_id.clone(),
                typing_users,
            })
            .into(),
        )
        .await;

        self.start_forwarder(&conversation_id).await;

        Ok(JoinAck {
            success: true,
            conversation_id,
            message: "Joined conversation".to_string(),
        })
    }

    /// Relay store snapshots of a joined conversation to this connection.
    /// A store that cannot subscribe only costs the snapshots.
    async fn start_forwarder(&mut self, conversation_id: &ConversationId) {
        if self
            .forwarders
            .get(conversation_id)
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }

        let mut subscription = match self.state.store.subscribe(conversation_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let policy = on_store_error(Operation::Subscribe, &e);
                warn!(
                    conversation = %conversation_id,
                    error = %e,
                    ?policy,
                    "snapshot subscription unavailable"
                );
                return;
            }
        };

        let rooms = self.state.rooms.clone();
        let connection = self.info.id;
        let conv = conversation_id.clone();
        let task = tokio::spawn(async move {
            while let Some(mut messages) = subscription.next().await {
                if messages.len() > SNAPSHOT_LIMIT {
                    messages.drain(..messages.len() - SNAPSHOT_LIMIT);
                }
                let frame = ServerEvent::Snapshot(ConversationSnapshot {
                    conversation_id: conv.clone(),
                    messages,
                })
                .into();
                if !rooms.send_to(&connection, frame).await {
                    break;
                }
            }
        });
        self.forwarders.insert(conversation_id.clone(), task);
    }

    async fn leave(&mut self, conversation_id: &ConversationId) {
        let conversation_id = conversation_id.normalize();
        self.state
            .rooms
            .leave(&self.info.id, &Room::conversation(&conversation_id))
            .await;
        if let Some(task) = self.forwarders.remove(&conversation_id) {
            task.abort();
        }
        debug!(user = %self.info.user_id(), conversation = %conversation_id, "left conversation");
    }

    /// Tear down everything the connection owns. Indicators are cleared
    /// before presence so observers never see a typing offline user.
    pub async fn close(mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        self.state.rooms.unregister(&self.info.id).await;
        let user = self.info.user_id();
        // indicators belong to the user; other tabs keep them alive
        if self.state.presence.release(self.info.id, user).await {
            self.state.typing.stop_all_for_user(user).await;
            self.state.presence.announce_offline(user).await;
        }
        info!(user = %self.info.user_id(), connection = %self.info.id, "connection closed");
    }

    async fn send(&self, frame: ServerFrame) {
        self.state.rooms.send_to(&self.info.id, frame).await;
    }

    async fn reply_error(&self, ack: Option<u64>, channel: ErrorChannel, err: &GatewayError) {
        let payload: ErrorPayload = err.to_payload();
        let frame = match (ack, channel) {
            (Some(ack), _) => ServerFrame::Ack(AckFrame::err(ack, payload)),
            (None, ErrorChannel::Message) => ServerEvent::MessageError(payload).into(),
            (None, ErrorChannel::Conversation) => ServerEvent::ConversationError(payload).into(),
        };
        self.send(frame).await;
    }

    fn log_error(&self, event: &str, err: &GatewayError) {
        let user = self.info.user_id();
        match err {
            GatewayError::Validation(_) => {
                debug!(user = %user, event, error = %err, "rejected event")
            }
            GatewayError::StoreFailure(_) => {
                error!(user = %user, event, error = %err, "event failed")
            }
            _ => warn!(user = %user, event, error = %err, "rejected event"),
        }
    }
}

fn to_value<T: serde::Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{connect, test_state};
    use courier_shared::protocol::{ConversationRef, ErrorCode, SendMessagePayload};
    use courier_shared::{Conversation, MessageKind};
    use courier_store::{DocumentStore, MemoryStore};

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let state = test_state(MemoryStore::new());
        let mut alice = connect(&state, "alice").await;
        let conv = ConversationId::from("direct_bob_alice");

        for ack in [1, 2, 3] {
            alice.send(ClientEvent::Join(conv.clone()), Some(ack)).await;
        }
        let room = Room::conversation(&conv);
        assert_eq!(state.rooms.room_size(&room).await, 1);

        let acks: Vec<AckFrame> = alice
            .frames()
            .await
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Ack(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(acks.len(), 3);
        for ack in acks {
            assert!(ack.error.is_none());
            let data: JoinAck = serde_json::from_value(ack.data).unwrap();
            assert_eq!(data.conversation_id.as_str(), "direct_alice_bob");
        }
    }

    #[tokio::test]
    async fn test_join_non_member_reports_conversation_error() {
        let store = MemoryStore::new();
        store
            .put_conversation(&Conversation::group("g1".into(), "Deals", &"owner".into(), Vec::new()))
            .await
            .unwrap();
        let state = test_state(store);
        let mut mallory = connect(&state, "mallory").await;
        mallory.frames().await;

        mallory.send(ClientEvent::Join("g1".into()), None).await;
        let events = mallory.events().await;
        assert!(events.iter().any(
            |e| matches!(e, ServerEvent::ConversationError(p) if p.code == ErrorCode::NotMember)
        ));
        assert_eq!(state.rooms.room_size(&Room::conversation(&"g1".into())).await, 0);
    }

    #[tokio::test]
    async fn test_join_receives_snapshot_of_later_writes() {
        let state = test_state(MemoryStore::new());
        let mut alice = connect(&state, "alice").await;
        let bob = connect(&state, "bob").await;
        alice.send(ClientEvent::Join("direct_alice_bob".into()), None).await;
        alice.frames().await;

        state
            .router
            .send(
                &bob.info,
                SendMessagePayload {
                    conversation_id: Some("direct_alice_bob".into()),
                    kind: Some(MessageKind::Text),
                    text: "hi".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let snapshots: Vec<ConversationSnapshot> = alice
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(snapshots.iter().any(|s| s.messages.len() == 1));
    }

    #[tokio::test]
    async fn test_malformed_frame_with_ack_gets_error_ack() {
        let state = test_state(MemoryStore::new());
        let mut alice = connect(&state, "alice").await;
        alice.frames().await;

        alice
            .session
            .handle_text(r#"{"event":"message:read","data":{"bogus":1},"ack":9}"#)
            .await;
        alice.session.handle_text("not json").await;

        let frames = alice.frames().await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Ack(a) if a.ack == 9
                && a.error.as_ref().map(|e| e.code) == Some(ErrorCode::Validation)
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Event(ServerEvent::MessageError(p)) if p.code == ErrorCode::Validation
        )));
    }

    #[tokio::test]
    async fn test_typing_from_non_member_is_dropped() {
        let store = MemoryStore::new();
        store
            .put_conversation(&Conversation::group(
                "g1".into(),
                "Deals",
                &"owner".into(),
                vec!["m1".into()],
            ))
            .await
            .unwrap();
        let state = test_state(store);
        let mut owner = connect(&state, "owner").await;
        let mut mallory = connect(&state, "mallory").await;
        owner.send(ClientEvent::Join("g1".into()), None).await;
        owner.frames().await;

        mallory
            .send(ClientEvent::TypingStart(ConversationRef::from(ConversationId::from("g1"))), None)
            .await;
        assert!(state.typing.current(&"g1".into()).await.is_empty());
        assert!(!owner
            .events()
            .await
            .iter()
            .any(|e| matches!(e, ServerEvent::Typing(_))));
        assert!(mallory.frames().await.iter().all(|f| !matches!(
            f,
            ServerFrame::Event(ServerEvent::MessageError(_))
        )));
    }

    #[tokio::test]
    async fn test_close_clears_typing_then_presence() {
        let state = test_state(MemoryStore::new());
        let mut watcher = connect(&state, "bob").await;
        watcher.send(ClientEvent::Join("direct_alice_bob".into()), None).await;
        let mut alice = connect(&state, "alice").await;
        alice
            .send(
                ClientEvent::TypingStart(ConversationRef::from(ConversationId::from(
                    "direct_bob_alice",
                ))),
                None,
            )
            .await;
        watcher.frames().await;

        alice.session.close().await;

        let events = watcher.events().await;
        let typing_off = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Typing(t) if !t.typing));
        let offline = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Presence(p) if !p.online));
        assert!(typing_off.unwrap() < offline.unwrap());
        assert!(!state.presence.is_online(&"alice".into()).await);
        assert_eq!(state.rooms.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closing_one_tab_keeps_typing_alive() {
        let state = test_state(MemoryStore::new());
        let mut watcher = connect(&state, "bob").await;
        watcher.send(ClientEvent::Join("direct_alice_bob".into()), None).await;
        let first_tab = connect(&state, "alice").await;
        let mut second_tab = connect(&state, "alice").await;
        second_tab
            .send(
                ClientEvent::TypingStart(ConversationRef::from(ConversationId::from(
                    "direct_alice_bob",
                ))),
                None,
            )
            .await;
        watcher.frames().await;

        first_tab.session.close().await;

        let events = watcher.events().await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::Typing(t) if !t.typing)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::Presence(p) if !p.online)));
        assert!(state.presence.is_online(&"alice".into()).await);
    }
}
