//! The client view as an explicit reducer.
//!
//! Every change, local or remote, goes through [`ClientState::reduce`].
//! Merging of message lists is delegated to [`crate::merge`].

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use courier_shared::protocol::{
    DeliveryReceipt, PresenceUpdate, ReadReceipt, RecordingUpdate, TypingCurrent, TypingUpdate,
};
use courier_shared::{Conversation, ConversationId, MessageRecord, UserId};

use crate::merge;
use crate::model::{ClientMessage, ConnectionStatus};

/// Message ids with receipts held until the message shows up. The oldest
/// id is evicted when a new one arrives at the cap.
const MAX_BUFFERED_RECEIPTS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BufferedReceipt {
    Delivered(UserId),
    Read(UserId),
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Optimistic insert of our own message under its local id.
    LocalSend(MessageRecord),
    SendAcked {
        conversation_id: ConversationId,
        local_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
    },
    SendFailed {
        conversation_id: ConversationId,
        local_id: String,
        error: String,
    },
    /// A failed message is being transmitted again.
    Resend {
        conversation_id: ConversationId,
        local_id: String,
    },
    RemotePush(MessageRecord),
    SnapshotReplace {
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    },
    Delivered(DeliveryReceipt),
    Read(ReadReceipt),
    Reaction {
        conversation_id: ConversationId,
        message_id: String,
        user_id: UserId,
        emoji: Option<String>,
    },
    Presence(PresenceUpdate),
    OnlineUsers(Vec<UserId>),
    Typing(TypingUpdate),
    TypingCurrent(TypingCurrent),
    Recording(RecordingUpdate),
    ConversationUpsert(Conversation),
    Connection(ConnectionStatus),
}

#[derive(Debug, Clone)]
pub struct ClientState {
    user_id: UserId,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<ClientMessage>>,
    connection: ConnectionStatus,
    online: BTreeSet<UserId>,
    last_seen: HashMap<UserId, i64>,
    typing: HashMap<ConversationId, BTreeSet<UserId>>,
    recording: HashMap<ConversationId, BTreeSet<UserId>>,
    buffered: HashMap<String, Vec<BufferedReceipt>>,
    buffer_order: VecDeque<String>,
}

impl ClientState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            conversations: HashMap::new(),
            messages: HashMap::new(),
            connection: ConnectionStatus::Disconnected,
            online: BTreeSet::new(),
            last_seen: HashMap::new(),
            typing: HashMap::new(),
            recording: HashMap::new(),
            buffered: HashMap::new(),
            buffer_order: VecDeque::new(),
        }
    }

    pub fn reduce(&mut self, action: Action) {
        match action {
            Action::LocalSend(record) => {
                let list = self.list_mut(&record.conversation_id);
                merge::upsert(list, record);
            }
            Action::SendAcked {
                conversation_id,
                local_id,
                message_id,
                timestamp,
            } => {
                let list = self.list_mut(&conversation_id);
                if merge::reconcile_ack(list, &local_id, &message_id, timestamp) {
                    self.apply_buffered(&conversation_id, &message_id);
                } else {
                    debug!(local = %local_id, message = %message_id, "ack for unknown message");
                }
            }
            Action::SendFailed {
                conversation_id,
                local_id,
                error,
            } => {
                if let Some(m) = self.find_mut(&conversation_id, &local_id) {
                    m.failure = Some(error);
                }
            }
            Action::Resend {
                conversation_id,
                local_id,
            } => {
                if let Some(m) = self.find_mut(&conversation_id, &local_id) {
                    m.failure = None;
                }
            }
            Action::RemotePush(record) => {
                let conversation_id = record.conversation_id.clone();
                let id = record.id.clone();
                merge::upsert(self.list_mut(&conversation_id), record);
                self.apply_buffered(&conversation_id, &id);
            }
            Action::SnapshotReplace {
                conversation_id,
                messages,
            } => {
                let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
                let list = self.list_mut(&conversation_id);
                *list = merge::merge_snapshot(list, messages);
                for id in ids {
                    self.apply_buffered(&conversation_id, &id);
                }
            }
            Action::Delivered(receipt) => {
                let buffered = BufferedReceipt::Delivered(receipt.user_id.clone());
                match self.find_mut(&receipt.conversation_id, &receipt.message_id) {
                    Some(m) => {
                        m.record.mark_delivered(&receipt.user_id);
                    }
                    None => self.buffer(receipt.message_id, buffered),
                }
            }
            Action::Read(receipt) => {
                for id in receipt.message_ids {
                    match self.find_mut(&receipt.conversation_id, &id) {
                        Some(m) => {
                            m.record.mark_read(&receipt.user_id);
                        }
                        None => self.buffer(id, BufferedReceipt::Read(receipt.user_id.clone())),
                    }
                }
            }
            Action::Reaction {
                conversation_id,
                message_id,
                user_id,
                emoji,
            } => {
                if let Some(m) = self.find_mut(&conversation_id, &message_id) {
                    m.record.apply_reaction(&user_id, emoji.as_deref());
                }
            }
            Action::Presence(update) => {
                if update.online {
                    self.online.insert(update.user_id);
                } else {
                    if let Some(ts) = update.last_seen {
                        self.last_seen.insert(update.user_id.clone(), ts);
                    }
                    self.online.remove(&update.user_id);
                    for set in self.typing.values_mut().chain(self.recording.values_mut()) {
                        set.remove(&update.user_id);
                    }
                }
            }
            Action::OnlineUsers(users) => {
                self.online = users.into_iter().collect();
            }
            Action::Typing(update) => {
                set_flag(&mut self.typing, update.conversation_id, update.user_id, update.typing);
            }
            Action::TypingCurrent(current) => {
                self.typing.insert(
                    current.conversation_id.normalize(),
                    current.typing_users.into_iter().collect(),
                );
            }
            Action::Recording(update) => {
                set_flag(
                    &mut self.recording,
                    update.conversation_id,
                    update.user_id,
                    update.recording,
                );
            }
            Action::ConversationUpsert(conversation) => {
                self.conversations
                    .insert(conversation.id.normalize(), conversation);
            }
            Action::Connection(status) => {
                self.connection = status;
                if !status.is_connected() {
                    // indicators are server memory and go stale once disconnected
                    self.typing.clear();
                    self.recording.clear();
                }
            }
        }
    }

    fn list_mut(&mut self, conversation_id: &ConversationId) -> &mut Vec<ClientMessage> {
        self.messages.entry(conversation_id.normalize()).or_default()
    }

    fn find_mut(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Option<&mut ClientMessage> {
        self.messages
            .get_mut(&conversation_id.normalize())?
            .iter_mut()
            .find(|m| m.record.id == message_id)
    }

    fn buffer(&mut self, message_id: String, receipt: BufferedReceipt) {
        if !self.buffered.contains_key(&message_id) {
            while self.buffered.len() >= MAX_BUFFERED_RECEIPTS {
                let Some(oldest) = self.buffer_order.pop_front() else {
                    break;
                };
                debug!(message = %oldest, "receipt buffer full, evicting oldest");
                self.buffered.remove(&oldest);
            }
            self.buffer_order.push_back(message_id.clone());
        }
        let entry = self.buffered.entry(message_id).or_default();
        if !entry.contains(&receipt) {
            entry.push(receipt);
        }
    }

    fn apply_buffered(&mut self, conversation_id: &ConversationId, message_id: &str) {
        let Some(receipts) = self.buffered.remove(message_id) else {
            return;
        };
        self.buffer_order.retain(|id| id != message_id);
        if let Some(m) = self.find_mut(conversation_id, message_id) {
            for receipt in receipts {
                match receipt {
                    BufferedReceipt::Delivered(user) => {
                        m.record.mark_delivered(&user);
                    }
                    BufferedReceipt::Read(user) => {
                        m.record.mark_read(&user);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[ClientMessage] {
        self.messages
            .get(&conversation_id.normalize())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &ConversationId, id: &str) -> Option<&ClientMessage> {
        self.messages(conversation_id).iter().find(|m| m.id() == id)
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(&conversation_id.normalize())
    }

    /// Messages from others that this user has not read.
    pub fn unread_count(&self, conversation_id: &ConversationId) -> usize {
        self.messages(conversation_id)
            .iter()
            .filter(|m| m.record.sender_id != self.user_id && !m.record.read.contains(&self.user_id))
            .count()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    pub fn online_users(&self) -> impl Iterator<Item = &UserId> {
        self.online.iter()
    }

    pub fn last_seen(&self, user: &UserId) -> Option<i64> {
        self.last_seen.get(user).copied()
    }

    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<&UserId> {
        self.typing
            .get(&conversation_id.normalize())
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    pub fn recording_users(&self, conversation_id: &ConversationId) -> Vec<&UserId> {
        self.recording
            .get(&conversation_id.normalize())
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    pub fn buffered_receipts(&self) -> usize {
        self.buffered.values().map(Vec::len).sum()
    }
}

fn set_flag(
    map: &mut HashMap<ConversationId, BTreeSet<UserId>>,
    conversation_id: ConversationId,
    user: UserId,
    active: bool,
) {
    let key = conversation_id.normalize();
    if active {
        map.entry(key).or_default().insert(user);
    } else if let Some(set) = map.get_mut(&key) {
        set.remove(&user);
        if set.is_empty() {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SendStatus;
    use courier_shared::{MessageKind, MessageMetadata, NewMessage};

    fn conv() -> ConversationId {
        "direct_alice_bob".into()
    }

    fn record(id: &str, sender: &str, ts: i64) -> MessageRecord {
        NewMessage {
            conversation_id: conv(),
            sender_id: sender.into(),
            kind: MessageKind::Text,
            text: format!("body of {id}"),
            nonce: None,
            sender_text: None,
            sender_nonce: None,
            reply_to: None,
            metadata: MessageMetadata::default(),
            client_id: None,
            timestamp: DateTime::from_timestamp_millis(ts).unwrap(),
        }
        .into_record(id.into())
    }

    fn local(id: &str, ts: i64) -> MessageRecord {
        let mut r = record(id, "alice", ts);
        r.client_id = Some(id.into());
        r
    }

    fn ids(state: &ClientState) -> Vec<String> {
        state.messages(&conv()).iter().map(|m| m.id().to_string()).collect()
    }

    #[test]
    fn test_empty_snapshot_keeps_messages() {
        let mut state = ClientState::new("alice".into());
        for i in 0..4 {
            state.reduce(Action::RemotePush(record(&format!("m{i}"), "bob", 1000 + i)));
        }
        state.reduce(Action::SnapshotReplace {
            conversation_id: conv(),
            messages: Vec::new(),
        });
        assert_eq!(state.messages(&conv()).len(), 4);
    }

    #[test]
    fn test_optimistic_send_lifecycle() {
        let mut state = ClientState::new("alice".into());
        state.reduce(Action::LocalSend(local("local_1", 1000)));
        let me = UserId::from("alice");
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Sending);

        // the receipt for the real id beats the ack
        state.reduce(Action::Delivered(DeliveryReceipt {
            message_id: "srv_1".into(),
            user_id: "bob".into(),
            conversation_id: "direct_bob_alice".into(),
        }));
        assert_eq!(state.buffered_receipts(), 1);

        state.reduce(Action::SendAcked {
            conversation_id: conv(),
            local_id: "local_1".into(),
            message_id: "srv_1".into(),
            timestamp: DateTime::from_timestamp_millis(1001).unwrap(),
        });
        assert_eq!(ids(&state), ["srv_1"]);
        assert_eq!(state.buffered_receipts(), 0);
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Delivered);

        let mut echo = record("srv_1", "alice", 1001);
        echo.client_id = Some("local_1".into());
        state.reduce(Action::RemotePush(echo));
        assert_eq!(ids(&state), ["srv_1"]);
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Delivered);
    }

    #[test]
    fn test_failure_and_resend() {
        let mut state = ClientState::new("alice".into());
        state.reduce(Action::LocalSend(local("local_1", 1000)));
        state.reduce(Action::SendFailed {
            conversation_id: conv(),
            local_id: "local_1".into(),
            error: "rate limited".into(),
        });
        let me = UserId::from("alice");
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Failed);

        state.reduce(Action::Resend {
            conversation_id: conv(),
            local_id: "local_1".into(),
        });
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Sending);
    }

    #[test]
    fn test_read_receipt_and_unread_count() {
        let mut state = ClientState::new("alice".into());
        state.reduce(Action::RemotePush(record("m1", "bob", 1)));
        state.reduce(Action::RemotePush(record("m2", "bob", 2)));
        state.reduce(Action::RemotePush(record("m3", "alice", 3)));
        assert_eq!(state.unread_count(&conv()), 2);

        state.reduce(Action::Read(ReadReceipt {
            conversation_id: conv(),
            message_ids: vec!["m1".into(), "m2".into()],
            user_id: "alice".into(),
        }));
        assert_eq!(state.unread_count(&conv()), 0);
        assert!(state.message(&conv(), "m1").unwrap().record.delivered.contains(&UserId::from("alice")));
    }

    #[test]
    fn test_reaction_is_exclusive() {
        let mut state = ClientState::new("alice".into());
        state.reduce(Action::RemotePush(record("m1", "bob", 1)));
        for emoji in ["👍", "❤️"] {
            state.reduce(Action::Reaction {
                conversation_id: conv(),
                message_id: "m1".into(),
                user_id: "alice".into(),
                emoji: Some(emoji.into()),
            });
        }
        let reactions = &state.message(&conv(), "m1").unwrap().record.reactions;
        assert_eq!(reactions.len(), 1);
        assert!(reactions["❤️"].contains(&UserId::from("alice")));
    }

    #[test]
    fn test_presence_and_indicators() {
        let mut state = ClientState::new("alice".into());
        state.reduce(Action::Connection(ConnectionStatus::Connected));
        state.reduce(Action::OnlineUsers(vec!["bob".into(), "carol".into()]));
        state.reduce(Action::Typing(TypingUpdate {
            conversation_id: conv(),
            user_id: "bob".into(),
            typing: true,
            user: None,
        }));
        assert_eq!(state.typing_users(&"direct_bob_alice".into()), vec![&UserId::from("bob")]);

        state.reduce(Action::Presence(PresenceUpdate {
            user_id: "bob".into(),
            online: false,
            tier: None,
            display_name: None,
            photo_url: None,
            last_seen: Some(42),
        }));
        assert!(!state.is_online(&"bob".into()));
        assert_eq!(state.last_seen(&"bob".into()), Some(42));
        assert!(state.typing_users(&conv()).is_empty());

        state.reduce(Action::Recording(RecordingUpdate {
            conversation_id: conv(),
            user_id: "carol".into(),
            recording: true,
            user: None,
        }));
        state.reduce(Action::Connection(ConnectionStatus::Reconnecting(1)));
        assert!(state.recording_users(&conv()).is_empty());
    }

    #[test]
    fn test_full_receipt_buffer_evicts_oldest() {
        let mut state = ClientState::new("alice".into());
        for i in 0..600 {
            state.reduce(Action::Delivered(DeliveryReceipt {
                message_id: format!("stray_{i}"),
                user_id: "bob".into(),
                conversation_id: conv(),
            }));
        }
        assert_eq!(state.buffered_receipts(), MAX_BUFFERED_RECEIPTS);

        state.reduce(Action::LocalSend(local("local_1", 1000)));
        state.reduce(Action::Delivered(DeliveryReceipt {
            message_id: "srv_0".into(),
            user_id: "bob".into(),
            conversation_id: conv(),
        }));
        assert_eq!(state.buffered_receipts(), MAX_BUFFERED_RECEIPTS);

        state.reduce(Action::SendAcked {
            conversation_id: conv(),
            local_id: "local_1".into(),
            message_id: "srv_0".into(),
            timestamp: DateTime::from_timestamp_millis(1001).unwrap(),
        });
        let me = UserId::from("alice");
        assert_eq!(state.messages(&conv())[0].status(&me), SendStatus::Delivered);
        assert_eq!(state.buffered_receipts(), MAX_BUFFERED_RECEIPTS - 1);
    }
}
