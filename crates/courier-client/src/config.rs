use std::time::Duration;

/// Connection settings for [`crate::WsTransport`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint, e.g. `ws://localhost:3001/ws`.
    pub server_url: String,
    /// Bearer credential presented once per handshake.
    pub token: String,
    pub ack_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            ack_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }

    /// Handshake URL carrying the token as a query parameter.
    pub fn handshake_url(&self) -> String {
        let sep = if self.server_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}token={}", self.server_url, self.token)
    }
}
