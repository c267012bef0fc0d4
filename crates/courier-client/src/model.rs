use courier_shared::{MessageRecord, UserId};

/// Delivery state of a message as shown to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Lost the socket and waiting out backoff before attempt `n`.
    Reconnecting(u32),
    /// The server refused the credential. Nothing is retried until the
    /// caller supplies a new one.
    Unauthenticated,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// A message as held by the client view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub record: MessageRecord,
    /// Why the last transmit failed. Cleared on retry.
    pub failure: Option<String>,
}

impl ClientMessage {
    pub fn new(record: MessageRecord) -> Self {
        Self {
            record,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Status from `viewer`'s side. Only meaningful for their own messages.
    pub fn status(&self, viewer: &UserId) -> SendStatus {
        if self.failure.is_some() {
            return SendStatus::Failed;
        }
        let local = self
            .record
            .client_id
            .as_deref()
            .map_or(self.record.is_temporary(), |cid| cid == self.record.id);
        if local {
            return SendStatus::Sending;
        }
        let others = |set: &std::collections::BTreeSet<UserId>| set.iter().any(|u| u != viewer);
        if others(&self.record.read) {
            SendStatus::Read
        } else if others(&self.record.delivered) {
            SendStatus::Delivered
        } else {
            SendStatus::Sent
        }
    }
}

impl From<MessageRecord> for ClientMessage {
    fn from(record: MessageRecord) -> Self {
        Self::new(record)
    }
}
