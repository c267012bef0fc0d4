//! Socket wire protocol.
//!
//! Every frame is a JSON text message. Client frames carry a named event,
//! its payload and an optional numeric ack id:
//!
//! ```json
//! {"event": "message:send", "data": {"conversationId": "direct_a_b", "type": "text"}, "ack": 7}
//! ```
//!
//! The server answers acked requests with `{"ack": 7, "error": null, "data": {...}}`
//! and pushes events as `{"event": "message:new", "data": {...}}`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{MessageKind, MessageMetadata, MessageRecord};
use crate::types::{ConversationId, Identity, Tier, UserId};

// ---------------------------------------------------------------------------
// Client -> server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub sender_text: Option<String>,
    #[serde(default)]
    pub sender_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    /// Temporary id of the optimistic insert on the sending client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredPayload {
    pub message_id: String,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactPayload {
    pub conversation_id: ConversationId,
    pub message_id: String,
    /// `None` clears the user's reaction.
    pub emoji: Option<String>,
}

/// Conversation reference accepted either as `{"conversationId": ".."}`
/// or as a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConversationRef {
    Object {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    Bare(ConversationId),
}

impl ConversationRef {
    pub fn id(&self) -> &ConversationId {
        match self {
            ConversationRef::Object { conversation_id } => conversation_id,
            ConversationRef::Bare(id) => id,
        }
    }
}

impl From<ConversationId> for ConversationRef {
    fn from(conversation_id: ConversationId) -> Self {
        ConversationRef::Object { conversation_id }
    }
}

/// All events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "message:delivered")]
    Delivered(DeliveredPayload),
    #[serde(rename = "message:read")]
    Read(ReadPayload),
    #[serde(rename = "message:react")]
    React(ReactPayload),
    #[serde(rename = "typing:start")]
    TypingStart(ConversationRef),
    #[serde(rename = "typing:stop")]
    TypingStop(ConversationRef),
    #[serde(rename = "recording:start")]
    RecordingStart(ConversationRef),
    #[serde(rename = "recording:stop")]
    RecordingStop(ConversationRef),
    #[serde(rename = "conversation:join")]
    Join(ConversationId),
    #[serde(rename = "conversation:leave")]
    Leave(ConversationId),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "message:send",
            ClientEvent::Delivered(_) => "message:delivered",
            ClientEvent::Read(_) => "message:read",
            ClientEvent::React(_) => "message:react",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
            ClientEvent::RecordingStart(_) => "recording:start",
            ClientEvent::RecordingStop(_) => "recording:stop",
            ClientEvent::Join(_) => "conversation:join",
            ClientEvent::Leave(_) => "conversation:leave",
        }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub event: ClientEvent,
    pub ack: Option<u64>,
}

/// A client frame that could not be decoded. `ack` and `event` are
/// recovered when present so the sender can still be answered.
#[derive(Debug)]
pub struct FrameError {
    pub ack: Option<u64>,
    pub event: Option<String>,
    pub error: ProtocolError,
}

impl ClientFrame {
    pub fn new(event: ClientEvent, ack: Option<u64>) -> Self {
        Self { event, ack }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameError {
            ack: None,
            event: None,
            error: e.into(),
        })?;
        if !value.is_object() {
            return Err(FrameError {
                ack: None,
                event: None,
                error: ProtocolError::NotAnObject,
            });
        }

        let ack = value.get("ack").and_then(Value::as_u64);
        let event = ClientEvent::deserialize(&value).map_err(|e| FrameError {
            ack,
            event: value.get("event").and_then(Value::as_str).map(str::to_string),
            error: e.into(),
        })?;
        Ok(Self { event, ack })
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(&self.event)?;
        if let (Some(ack), Some(obj)) = (self.ack, value.as_object_mut()) {
            obj.insert("ack".to_string(), Value::from(ack));
        }
        Ok(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

/// Cosmetic sender details attached to broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
    pub tier: Tier,
}

impl From<&Identity> for SenderInfo {
    fn from(identity: &Identity) -> Self {
        Self {
            display_name: identity.display_name.clone(),
            photo_url: identity.photo_url.clone(),
            tier: identity.tier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: UserId,
    pub tier: Tier,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
    /// Unix epoch milliseconds.
    pub connected_at: i64,
}

/// Full message as fanned out to conversation members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageBroadcast {
    #[serde(flatten)]
    pub message: MessageRecord,
    pub sender: SenderInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message_id: String,
    pub conversation_id: ConversationId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<String>,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub conversation_id: ConversationId,
    pub message_id: String,
    pub user_id: UserId,
    pub emoji: Option<String>,
    /// Authoritative reaction map when the durable record was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<BTreeMap<String, BTreeSet<UserId>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    /// Unix epoch milliseconds, offline transitions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineUsers {
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<SenderInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingUpdate {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<SenderInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingCurrent {
    pub conversation_id: ConversationId,
    pub typing_users: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessageRecord>,
}

/// Machine-readable reason attached to every error event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotMember,
    RateLimited,
    StoreFailure,
    Unauthenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// All events the server pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "auth:success")]
    AuthSuccess(AuthSuccess),
    #[serde(rename = "message:new")]
    NewMessage(MessageBroadcast),
    #[serde(rename = "message:sent")]
    MessageSent(MessageSent),
    #[serde(rename = "message:delivered")]
    Delivered(DeliveryReceipt),
    #[serde(rename = "message:read")]
    Read(ReadReceipt),
    #[serde(rename = "message:reaction")]
    Reaction(ReactionUpdate),
    #[serde(rename = "presence:update")]
    Presence(PresenceUpdate),
    #[serde(rename = "presence:online-users")]
    OnlineUsers(OnlineUsers),
    #[serde(rename = "typing:update")]
    Typing(TypingUpdate),
    #[serde(rename = "recording:update")]
    Recording(RecordingUpdate),
    #[serde(rename = "typing:current")]
    TypingCurrent(TypingCurrent),
    #[serde(rename = "conversation:snapshot")]
    Snapshot(ConversationSnapshot),
    #[serde(rename = "message:error")]
    MessageError(ErrorPayload),
    #[serde(rename = "conversation:error")]
    ConversationError(ErrorPayload),
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub success: bool,
    pub message_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub success: bool,
    pub conversation_id: ConversationId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessAck {
    pub success: bool,
}

/// Reply to an acked client frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckFrame {
    pub ack: u64,
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub data: Value,
}

impl AckFrame {
    pub fn ok<T: Serialize>(ack: u64, data: &T) -> Self {
        Self {
            ack,
            error: None,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn err(ack: u64, error: ErrorPayload) -> Self {
        Self {
            ack,
            error: Some(error),
            data: Value::Null,
        }
    }
}

/// Anything written to a client socket.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(ServerEvent),
    Ack(AckFrame),
}

impl ServerFrame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        if value.get("ack").is_some() {
            Ok(ServerFrame::Ack(serde_json::from_value(value)?))
        } else {
            Ok(ServerFrame::Event(serde_json::from_value(value)?))
        }
    }
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        ServerFrame::Event(event)
    }
}
