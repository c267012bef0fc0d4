//! Orchestration of the client view, the keyring and the transport.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::constants::LOCAL_ID_PREFIX;
use courier_shared::message::{is_local_id, is_temporary_id};
use courier_shared::protocol::{
    ClientEvent, ConversationRef, DeliveredPayload, ReactPayload, ReadPayload, ReadReceipt,
    SendAck, SendMessagePayload, ServerEvent,
};
use courier_shared::{ConversationId, MessageKind, MessageMetadata, MessageRecord, NewMessage, UserId};

use crate::error::ClientError;
use crate::keyring::Keyring;
use crate::model::{ClientMessage, ConnectionStatus};
use crate::outbox::{Outbox, PendingSend};
use crate::state::{Action, ClientState};
use crate::transport::{Transport, TransportEvent};

/// A message about to be composed.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub kind: MessageKind,
    pub text: String,
    pub reply_to: Option<String>,
    pub metadata: MessageMetadata,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct ChatClient {
    user_id: UserId,
    state: Arc<Mutex<ClientState>>,
    keyring: Arc<Keyring>,
    transport: Arc<dyn Transport>,
    outbox: Arc<Mutex<Outbox>>,
    joined: Arc<Mutex<BTreeSet<ConversationId>>>,
}

impl ChatClient {
    pub fn new(keyring: Arc<Keyring>, transport: Arc<dyn Transport>) -> Self {
        let user_id = keyring.user_id().clone();
        Self {
            state: Arc::new(Mutex::new(ClientState::new(user_id.clone()))),
            user_id,
            keyring,
            transport,
            outbox: Arc::new(Mutex::new(Outbox::new())),
            joined: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Consume transport events until the transport goes away.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Status(status) => self.on_status(status).await,
                TransportEvent::Event(event) => self.handle_event(event).await,
            }
        }
    }

    pub async fn reduce(&self, action: Action) {
        self.state.lock().await.reduce(action);
    }

    /// A copy of the current view.
    pub async fn snapshot(&self) -> ClientState {
        self.state.lock().await.clone()
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<ClientMessage> {
        self.state.lock().await.messages(conversation_id).to_vec()
    }

    pub fn display_text(&self, message: &ClientMessage) -> String {
        self.keyring.display_text(&message.record)
    }

    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<String, ClientError> {
        self.send(conversation_id, Draft::text(text)).await
    }

    /// Encrypt, insert optimistically, then transmit, or queue while
    /// offline. Returns the id the message ends up under: the server's
    /// once acknowledged, the local one otherwise.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        draft: Draft,
    ) -> Result<String, ClientError> {
        let conversation_id = conversation_id.normalize();
        let body = self.keyring.seal_for(&conversation_id, &draft.text)?;
        let local_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple());

        let message = NewMessage {
            conversation_id: conversation_id.clone(),
            sender_id: self.user_id.clone(),
            kind: draft.kind,
            text: body.text,
            nonce: body.nonce,
            sender_text: body.sender_text,
            sender_nonce: body.sender_nonce,
            reply_to: draft.reply_to,
            metadata: draft.metadata,
            client_id: Some(local_id.clone()),
            timestamp: Utc::now(),
        };
        let payload = payload_for(&message);
        self.reduce(Action::LocalSend(message.into_record(local_id.clone())))
            .await;

        if !self.transport.is_connected() {
            debug!(local = %local_id, "offline, queueing send");
            self.outbox.lock().await.push(PendingSend {
                local_id: local_id.clone(),
                payload,
            });
            return Ok(local_id);
        }
        self.transmit(local_id, payload).await
    }

    async fn transmit(
        &self,
        local_id: String,
        payload: SendMessagePayload,
    ) -> Result<String, ClientError> {
        let conversation_id = payload
            .conversation_id
            .clone()
            .ok_or_else(|| ClientError::UnknownMessage(local_id.clone()))?;

        match self.transport.request(ClientEvent::SendMessage(payload.clone())).await {
            Ok(data) => {
                let ack: SendAck = serde_json::from_value(data)?;
                let timestamp =
                    DateTime::<Utc>::from_timestamp_millis(ack.timestamp).unwrap_or_else(Utc::now);
                self.reduce(Action::SendAcked {
                    conversation_id,
                    local_id,
                    message_id: ack.message_id.clone(),
                    timestamp,
                })
                .await;
                Ok(ack.message_id)
            }
            Err(ClientError::NotConnected) => {
                debug!(local = %local_id, "connection lost, queueing send");
                self.outbox.lock().await.push(PendingSend {
                    local_id: local_id.clone(),
                    payload,
                });
                Ok(local_id)
            }
            Err(e) => {
                warn!(local = %local_id, error = %e, "send failed");
                self.reduce(Action::SendFailed {
                    conversation_id,
                    local_id,
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Transmit a failed message again. Failed sends are never retried
    /// without this call.
    pub async fn retry(
        &self,
        conversation_id: &ConversationId,
        local_id: &str,
    ) -> Result<String, ClientError> {
        let record = {
            let state = self.state.lock().await;
            state
                .message(conversation_id, local_id)
                .filter(|m| m.failure.is_some())
                .map(|m| m.record.clone())
                .ok_or_else(|| ClientError::UnknownMessage(local_id.to_string()))?
        };
        self.reduce(Action::Resend {
            conversation_id: conversation_id.normalize(),
            local_id: local_id.to_string(),
        })
        .await;

        let payload = payload_for_record(&record);
        if !self.transport.is_connected() {
            self.outbox.lock().await.push(PendingSend {
                local_id: local_id.to_string(),
                payload,
            });
            return Ok(local_id.to_string());
        }
        self.transmit(local_id.to_string(), payload).await
    }

    // -----------------------------------------------------------------------
    // Receipts, reactions, indicators
    // -----------------------------------------------------------------------

    /// Mark every unread message from others as read: delivered receipts
    /// first for those not yet delivered to us, then one read batch.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<usize, ClientError> {
        let conversation_id = conversation_id.normalize();
        let (undelivered, unread): (Vec<String>, Vec<String>) = {
            let state = self.state.lock().await;
            let incoming: Vec<&MessageRecord> = state
                .messages(&conversation_id)
                .iter()
                .map(|m| &m.record)
                .filter(|r| r.sender_id != self.user_id && !is_local_id(&r.id))
                .collect();
            (
                incoming
                    .iter()
                    .filter(|r| !r.delivered.contains(&self.user_id))
                    .map(|r| r.id.clone())
                    .collect(),
                incoming
                    .iter()
                    .filter(|r| !r.read.contains(&self.user_id))
                    .map(|r| r.id.clone())
                    .collect(),
            )
        };
        if unread.is_empty() {
            return Ok(0);
        }

        for message_id in undelivered {
            self.transport
                .emit(ClientEvent::Delivered(DeliveredPayload {
                    message_id,
                    conversation_id: conversation_id.clone(),
                }))
                .await?;
        }
        self.transport
            .emit(ClientEvent::Read(ReadPayload {
                conversation_id: conversation_id.clone(),
                message_ids: unread.clone(),
            }))
            .await?;

        let count = unread.len();
        self.reduce(Action::Read(ReadReceipt {
            conversation_id,
            message_ids: unread,
            user_id: self.user_id.clone(),
        }))
        .await;
        Ok(count)
    }

    /// Set or clear our reaction. Applied locally first; the remote write
    /// is skipped while the message id is still temporary.
    pub async fn react(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        emoji: Option<&str>,
    ) -> Result<(), ClientError> {
        let conversation_id = conversation_id.normalize();
        self.reduce(Action::Reaction {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_string(),
            user_id: self.user_id.clone(),
            emoji: emoji.map(str::to_string),
        })
        .await;

        if is_temporary_id(message_id) {
            debug!(message = %message_id, "reaction kept local until the message is confirmed");
            return Ok(());
        }
        self.transport
            .request(ClientEvent::React(ReactPayload {
                conversation_id,
                message_id: message_id.to_string(),
                emoji: emoji.map(str::to_string),
            }))
            .await
            .map(|_| ())
    }

    pub async fn set_typing(&self, conversation_id: &ConversationId, typing: bool) -> Result<(), ClientError> {
        let conv = ConversationRef::from(conversation_id.normalize());
        let event = if typing {
            ClientEvent::TypingStart(conv)
        } else {
            ClientEvent::TypingStop(conv)
        };
        self.transport.emit(event).await
    }

    pub async fn set_recording(
        &self,
        conversation_id: &ConversationId,
        recording: bool,
    ) -> Result<(), ClientError> {
        let conv = ConversationRef::from(conversation_id.normalize());
        let event = if recording {
            ClientEvent::RecordingStart(conv)
        } else {
            ClientEvent::RecordingStop(conv)
        };
        self.transport.emit(event).await
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    /// Join a conversation room. Remembered so it is re-joined after a
    /// reconnect.
    pub async fn join(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        let conversation_id = conversation_id.normalize();
        self.joined.lock().await.insert(conversation_id.clone());
        if !self.transport.is_connected() {
            return Ok(());
        }
        self.transport
            .request(ClientEvent::Join(conversation_id))
            .await
            .map(|_| ())
    }

    pub async fn leave(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        let conversation_id = conversation_id.normalize();
        self.joined.lock().await.remove(&conversation_id);
        if !self.transport.is_connected() {
            return Ok(());
        }
        self.transport.emit(ClientEvent::Leave(conversation_id)).await
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub async fn on_status(&self, status: ConnectionStatus) {
        self.reduce(Action::Connection(status)).await;
        if status.is_connected() {
            self.on_reconnected().await;
        }
    }

    /// Re-join remembered rooms, then drain the outbox in order.
    async fn on_reconnected(&self) {
        let rooms: Vec<ConversationId> = self.joined.lock().await.iter().cloned().collect();
        for conversation_id in rooms {
            if let Err(e) = self
                .transport
                .request(ClientEvent::Join(conversation_id.clone()))
                .await
            {
                warn!(conversation = %conversation_id, error = %e, "re-join failed");
            }
        }

        let pending = self.outbox.lock().await.drain();
        if !pending.is_empty() {
            info!(count = pending.len(), "draining outbox");
        }
        for (i, send) in pending.iter().enumerate() {
            if !self.transport.is_connected() {
                self.outbox.lock().await.requeue_front(pending[i..].to_vec());
                return;
            }
            // failures are recorded on the message itself
            let _ = self
                .transmit(send.local_id.clone(), send.payload.clone())
                .await;

            // dropped mid-drain: transmit queued it at the back
            let mut outbox = self.outbox.lock().await;
            if outbox.remove(&send.local_id).is_some() {
                outbox.requeue_front(pending[i..].to_vec());
                return;
            }
        }
    }

    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(broadcast) => {
                let record = broadcast.message;
                let from_other = record.sender_id != self.user_id;
                let (id, conversation_id) = (record.id.clone(), record.conversation_id.clone());
                self.reduce(Action::RemotePush(record)).await;
                if from_other && !is_local_id(&id) {
                    let ack = self
                        .transport
                        .emit(ClientEvent::Delivered(DeliveredPayload {
                            message_id: id,
                            conversation_id,
                        }))
                        .await;
                    if let Err(e) = ack {
                        debug!(error = %e, "delivered receipt not sent");
                    }
                }
            }
            ServerEvent::MessageSent(sent) => {
                if let Some(local_id) = sent.client_id {
                    let timestamp = DateTime::<Utc>::from_timestamp_millis(sent.timestamp)
                        .unwrap_or_else(Utc::now);
                    self.reduce(Action::SendAcked {
                        conversation_id: sent.conversation_id,
                        local_id,
                        message_id: sent.message_id,
                        timestamp,
                    })
                    .await;
                }
            }
            ServerEvent::Snapshot(snapshot) => {
                self.reduce(Action::SnapshotReplace {
                    conversation_id: snapshot.conversation_id,
                    messages: snapshot.messages,
                })
                .await;
            }
            ServerEvent::Delivered(receipt) => self.reduce(Action::Delivered(receipt)).await,
            ServerEvent::Read(receipt) => self.reduce(Action::Read(receipt)).await,
            ServerEvent::Reaction(update) => {
                self.reduce(Action::Reaction {
                    conversation_id: update.conversation_id,
                    message_id: update.message_id,
                    user_id: update.user_id,
                    emoji: update.emoji,
                })
                .await;
            }
            ServerEvent::Presence(update) => self.reduce(Action::Presence(update)).await,
            ServerEvent::OnlineUsers(list) => self.reduce(Action::OnlineUsers(list.users)).await,
            ServerEvent::Typing(update) => self.reduce(Action::Typing(update)).await,
            ServerEvent::Recording(update) => self.reduce(Action::Recording(update)).await,
            ServerEvent::TypingCurrent(current) => {
                self.reduce(Action::TypingCurrent(current)).await
            }
            ServerEvent::AuthSuccess(auth) => {
                info!(user = %auth.user_id, tier = %auth.tier, "authenticated");
            }
            ServerEvent::MessageError(e) | ServerEvent::ConversationError(e) => {
                warn!(code = ?e.code, error = %e.error, "server reported an error");
            }
        }
    }
}

fn payload_for(message: &NewMessage) -> SendMessagePayload {
    SendMessagePayload {
        conversation_id: Some(message.conversation_id.clone()),
        kind: Some(message.kind),
        text: message.text.clone(),
        nonce: message.nonce.clone(),
        sender_text: message.sender_text.clone(),
        sender_nonce: message.sender_nonce.clone(),
        reply_to: message.reply_to.clone(),
        metadata: Some(message.metadata.clone()),
        client_id: message.client_id.clone(),
    }
}

fn payload_for_record(record: &MessageRecord) -> SendMessagePayload {
    SendMessagePayload {
        conversation_id: Some(record.conversation_id.clone()),
        kind: Some(record.kind),
        text: record.text.clone(),
        nonce: record.nonce.clone(),
        sender_text: record.sender_text.clone(),
        sender_nonce: record.sender_nonce.clone(),
        reply_to: record.reply_to.clone(),
        metadata: Some(record.metadata.clone()),
        client_id: record.client_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use courier_shared::crypto::KeyPair;
    use courier_shared::protocol::{
        DeliveryReceipt, ErrorCode, ErrorPayload, MessageBroadcast, SenderInfo,
    };
    use courier_shared::Identity;
    use serde_json::{json, Value};

    use crate::model::SendStatus;

    /// Records what the client sends. Requests are answered from a
    /// scripted queue, or with a fresh server id for sends.
    #[derive(Default)]
    struct MockTransport {
        connected: AtomicBool,
        sent: std::sync::Mutex<Vec<ClientEvent>>,
        replies: std::sync::Mutex<VecDeque<Result<Value, ClientError>>>,
        next_id: AtomicU64,
    }

    impl MockTransport {
        fn online() -> Arc<Self> {
            let t = Self::default();
            t.connected.store(true, Ordering::SeqCst);
            Arc::new(t)
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn script(&self, reply: Result<Value, ClientError>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn sent(&self) -> Vec<ClientEvent> {
            self.sent.lock().unwrap().clone()
        }

        fn names(&self) -> Vec<&'static str> {
            self.sent().iter().map(ClientEvent::name).collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
            if !self.is_connected() {
                return Err(ClientError::NotConnected);
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        async fn request(&self, event: ClientEvent) -> Result<Value, ClientError> {
            if !self.is_connected() {
                return Err(ClientError::NotConnected);
            }
            let is_send = matches!(event, ClientEvent::SendMessage(_));
            self.sent.lock().unwrap().push(event);
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return reply;
            }
            if is_send {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"success": true, "messageId": format!("srv_{n}"), "timestamp": 1_700_000_000_000i64 + n as i64}))
            } else {
                Ok(json!({"success": true}))
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn client(user: &str, transport: Arc<MockTransport>) -> ChatClient {
        let keyring = Arc::new(Keyring::new(user.into(), KeyPair::generate()));
        ChatClient::new(keyring, transport)
    }

    fn conv() -> ConversationId {
        "direct_alice_bob".into()
    }

    fn incoming(id: &str, sender: &str) -> ServerEvent {
        let record = NewMessage {
            conversation_id: conv(),
            sender_id: sender.into(),
            kind: MessageKind::Text,
            text: "hey".into(),
            nonce: None,
            sender_text: None,
            sender_nonce: None,
            reply_to: None,
            metadata: MessageMetadata::default(),
            client_id: None,
            timestamp: Utc::now(),
        }
        .into_record(id.into());
        ServerEvent::NewMessage(MessageBroadcast {
            message: record,
            sender: SenderInfo::from(&Identity::from_claims(sender.into(), None)),
        })
    }

    #[tokio::test]
    async fn test_send_replaces_local_id() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());

        let id = alice.send_text(&"direct_bob_alice".into(), "hi").await.unwrap();
        assert_eq!(id, "srv_0");
        let messages = alice.messages(&conv()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), "srv_0");
        assert_eq!(messages[0].status(&"alice".into()), SendStatus::Sent);
        assert_eq!(alice.display_text(&messages[0]), "hi");

        match &transport.sent()[0] {
            ClientEvent::SendMessage(p) => {
                assert_eq!(p.conversation_id.as_ref().unwrap().as_str(), "direct_alice_bob");
                assert!(p.client_id.as_deref().unwrap().starts_with(LOCAL_ID_PREFIX));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_before_ack_is_not_duplicated() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        transport.set_connected(false);
        let local_id = alice.send_text(&conv(), "hi").await.unwrap();

        // the server's broadcast of our own message arrives first
        let mut own = match incoming("srv_9", "alice") {
            ServerEvent::NewMessage(b) => b,
            _ => unreachable!(),
        };
        own.message.text = "hi".into();
        own.message.client_id = Some(local_id.clone());
        alice.handle_event(ServerEvent::NewMessage(own)).await;

        alice
            .reduce(Action::SendAcked {
                conversation_id: conv(),
                local_id,
                message_id: "srv_9".into(),
                timestamp: Utc::now(),
            })
            .await;
        let ids: Vec<String> = alice
            .messages(&conv())
            .await
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, ["srv_9"]);
    }

    #[tokio::test]
    async fn test_rejected_send_is_failed_until_retry() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        transport.script(Err(ClientError::Rejected(ErrorPayload {
            error: "Rate limit exceeded".into(),
            code: ErrorCode::RateLimited,
            details: None,
        })));

        let err = alice.send_text(&conv(), "hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        let failed = alice.messages(&conv()).await.remove(0);
        assert_eq!(failed.status(&"alice".into()), SendStatus::Failed);
        assert_eq!(transport.sent().len(), 1);

        let id = alice.retry(&conv(), failed.id()).await.unwrap();
        assert_eq!(id, "srv_0");
        let messages = alice.messages(&conv()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status(&"alice".into()), SendStatus::Sent);
    }

    #[tokio::test]
    async fn test_offline_sends_drain_in_order_after_rejoin() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        alice.join(&conv()).await.unwrap();
        transport.set_connected(false);
        alice.on_status(ConnectionStatus::Reconnecting(1)).await;

        for text in ["one", "two", "three"] {
            alice.send_text(&conv(), text).await.unwrap();
        }
        assert_eq!(alice.outbox_len().await, 3);
        assert_eq!(alice.messages(&conv()).await.len(), 3);

        transport.set_connected(true);
        alice.on_status(ConnectionStatus::Connected).await;
        assert_eq!(alice.outbox_len().await, 0);

        let names = transport.names();
        assert_eq!(
            names,
            [
                "conversation:join",
                "conversation:join",
                "message:send",
                "message:send",
                "message:send"
            ]
        );
        let texts: Vec<String> = transport
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::SendMessage(p) => Some(p.text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
        let messages = alice.messages(&conv()).await;
        assert!(messages.iter().all(|m| m.id().starts_with("srv_")));
    }

    #[tokio::test]
    async fn test_incoming_message_is_acknowledged() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());

        alice.handle_event(incoming("m1", "bob")).await;
        alice.handle_event(incoming("m2", "alice")).await;
        alice.handle_event(incoming("tmp_1_abc", "bob")).await;

        let delivered: Vec<String> = transport
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Delivered(p) => Some(p.message_id),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, ["m1", "tmp_1_abc"]);
        assert_eq!(alice.messages(&conv()).await.len(), 3);
    }

    #[tokio::test]
    async fn test_mark_read_covers_server_temporary_ids() {
        let transport = MockTransport::online();
        let bob = client("bob", transport.clone());
        bob.handle_event(incoming("tmp_1700000000000_abcdefghi", "alice")).await;
        assert_eq!(bob.snapshot().await.unread_count(&conv()), 1);

        assert_eq!(bob.mark_read(&conv()).await.unwrap(), 1);
        let read: Vec<Vec<String>> = transport
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Read(p) => Some(p.message_ids),
                _ => None,
            })
            .collect();
        assert_eq!(read, [vec!["tmp_1700000000000_abcdefghi".to_string()]]);
        assert_eq!(bob.snapshot().await.unread_count(&conv()), 0);
    }

    #[tokio::test]
    async fn test_mark_read_sends_delivered_first() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        transport.set_connected(false);
        alice.handle_event(incoming("m1", "bob")).await;
        alice.handle_event(incoming("m2", "bob")).await;
        transport.set_connected(true);

        assert_eq!(alice.mark_read(&conv()).await.unwrap(), 2);
        assert_eq!(
            transport.names(),
            ["message:delivered", "message:delivered", "message:read"]
        );
        assert_eq!(alice.snapshot().await.unread_count(&conv()), 0);
        assert_eq!(alice.mark_read(&conv()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_react_on_temporary_message_stays_local() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        alice.handle_event(incoming("tmp_1_abc", "bob")).await;
        alice.handle_event(incoming("m1", "bob")).await;
        let before = transport.sent().len();

        alice.react(&conv(), "tmp_1_abc", Some("👍")).await.unwrap();
        assert_eq!(transport.sent().len(), before);
        let state = alice.snapshot().await;
        assert_eq!(
            state.message(&conv(), "tmp_1_abc").unwrap().record.reaction_of(&"alice".into()),
            Some("👍")
        );

        alice.react(&conv(), "m1", Some("🔥")).await.unwrap();
        assert_eq!(transport.names().last(), Some(&"message:react"));
    }

    #[tokio::test]
    async fn test_receipt_for_unacked_message_is_buffered() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        transport.set_connected(false);
        let local_id = alice.send_text(&conv(), "hi").await.unwrap();

        alice
            .handle_event(ServerEvent::Delivered(DeliveryReceipt {
                message_id: "srv_0".into(),
                user_id: "bob".into(),
                conversation_id: conv(),
            }))
            .await;

        transport.set_connected(true);
        alice.on_status(ConnectionStatus::Connected).await;
        let message = alice.messages(&conv()).await.remove(0);
        assert_ne!(message.id(), local_id);
        assert_eq!(message.status(&"alice".into()), SendStatus::Delivered);
    }

    #[tokio::test]
    async fn test_typing_and_leave_events() {
        let transport = MockTransport::online();
        let alice = client("alice", transport.clone());
        alice.set_typing(&"direct_bob_alice".into(), true).await.unwrap();
        alice.set_recording(&conv(), false).await.unwrap();
        alice.leave(&conv()).await.unwrap();
        assert_eq!(
            transport.names(),
            ["typing:start", "recording:stop", "conversation:leave"]
        );
        match &transport.sent()[0] {
            ClientEvent::TypingStart(c) => assert_eq!(c.id().as_str(), "direct_alice_bob"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
