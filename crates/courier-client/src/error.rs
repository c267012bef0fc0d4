use thiserror::Error;

use courier_shared::error::{CryptoError, ProtocolError};
use courier_shared::protocol::ErrorPayload;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered the request with an error.
    #[error("Rejected by server: {}", .0.error)]
    Rejected(ErrorPayload),

    #[error("No acknowledgement within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(ProtocolError::Malformed(e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
