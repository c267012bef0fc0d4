//! # courier-client
//!
//! Client side of Courier: a reducer holding one consistent, ordered view
//! per conversation merged from store snapshots, real-time pushes and
//! optimistic local sends, plus the encryption glue, the offline outbox
//! and a reconnecting WebSocket transport.

pub mod client;
pub mod config;
pub mod error;
pub mod keyring;
pub mod merge;
pub mod model;
pub mod outbox;
pub mod state;
pub mod transport;

pub use client::{ChatClient, Draft};
pub use config::ClientConfig;
pub use error::ClientError;
pub use keyring::Keyring;
pub use model::{ClientMessage, ConnectionStatus, SendStatus};
pub use state::{Action, ClientState};
pub use transport::{Transport, TransportEvent, WsTransport};
