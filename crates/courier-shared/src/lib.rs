//! # courier-shared
//!
//! Types shared by the Courier server, store and client: identifiers,
//! the conversation/message model, the socket wire protocol, message
//! body encryption and signed authentication tokens.

pub mod auth;
pub mod constants;
pub mod conversation;
pub mod crypto;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use conversation::{Conversation, ConversationKind, GroupInfo, LastMessage};
pub use message::{MessageKind, MessageMetadata, MessageRecord, NewMessage};
pub use types::{ConversationId, Identity, Room, Tier, UserId};
