//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_HTTP_PORT, MESSAGE_LIMIT, RATE_WINDOW_SECS, RECORDING_TIMEOUT_SECS,
    TYPING_TIMEOUT_SECS,
};

/// Which [`DocumentStore`](courier_store::DocumentStore) backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`, or `PORT` to bind `0.0.0.0:{PORT}`
    /// Default: `0.0.0.0:3001`
    pub http_addr: SocketAddr,

    /// Origins allowed by CORS. Empty means any origin.
    /// Env: `ALLOWED_ORIGINS` (comma-separated)
    pub allowed_origins: Vec<String>,

    /// Address of a distributed fan-out backend. Only the in-process
    /// backend is built in, so this is reported and otherwise unused.
    /// Env: `FANOUT_URL`
    pub fanout_url: Option<String>,

    /// Ed25519 public key of the account service (hex-encoded, 64 chars).
    /// Env: `AUTH_ISSUER_PUBKEY`
    /// Default: all-zeros (development only, rejects every token).
    pub auth_issuer_pubkey: [u8; 32],

    /// Env: `STORE_BACKEND` (`sqlite` | `memory`)
    /// Default: `sqlite`
    pub store_backend: StoreBackend,

    /// SQLite database path. Unset means the platform data directory.
    /// Env: `STORE_PATH`
    pub store_path: Option<PathBuf>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Messages per user per rate window.
    /// Env: `MESSAGE_LIMIT`
    pub message_limit: u32,

    /// Env: `RATE_WINDOW_SECS`
    pub rate_window: Duration,

    /// Env: `TYPING_TIMEOUT_SECS`
    pub typing_timeout: Duration,

    /// Env: `RECORDING_TIMEOUT_SECS`
    pub recording_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            allowed_origins: Vec::new(),
            fanout_url: None,
            auth_issuer_pubkey: [0u8; 32],
            store_backend: StoreBackend::Sqlite,
            store_path: None,
            instance_name: "Courier".to_string(),
            message_limit: MESSAGE_LIMIT,
            rate_window: Duration::from_secs(RATE_WINDOW_SECS),
            typing_timeout: Duration::from_secs(TYPING_TIMEOUT_SECS),
            recording_timeout: Duration::from_secs(RECORDING_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = get("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.http_addr = ([0, 0, 0, 0], port).into(),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
            }
        }

        if let Some(addr) = get("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(origins) = get("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(url) = get("FANOUT_URL").filter(|u| !u.is_empty()) {
            config.fanout_url = Some(url);
        }

        if let Some(hex_key) = get("AUTH_ISSUER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_issuer_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid AUTH_ISSUER_PUBKEY, using default (dev-only)"
                    );
                }
            }
        }

        if let Some(backend) = get("STORE_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "sqlite" => config.store_backend = StoreBackend::Sqlite,
                "memory" => config.store_backend = StoreBackend::Memory,
                other => tracing::warn!(value = %other, "Unknown STORE_BACKEND, using sqlite"),
            }
        }

        if let Some(path) = get("STORE_PATH").filter(|p| !p.is_empty()) {
            config.store_path = Some(PathBuf::from(path));
        }

        if let Some(name) = get("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(val) = get("MESSAGE_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.message_limit = n,
                _ => tracing::warn!(value = %val, "Invalid MESSAGE_LIMIT, using default"),
            }
        }

        for (key, slot) in [
            ("RATE_WINDOW_SECS", &mut config.rate_window),
            ("TYPING_TIMEOUT_SECS", &mut config.typing_timeout),
            ("RECORDING_TIMEOUT_SECS", &mut config.recording_timeout),
        ] {
            if let Some(val) = get(key) {
                match val.parse::<u64>() {
                    Ok(secs) if secs > 0 => *slot = Duration::from_secs(secs),
                    _ => tracing::warn!(key, value = %val, "Invalid duration, using default"),
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 3001).into());
        assert_eq!(config.auth_issuer_pubkey, [0u8; 32]);
        assert_eq!(config.message_limit, 60);
        assert_eq!(config.typing_timeout, Duration::from_secs(10));
        assert_eq!(config.recording_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides() {
        let config = from_pairs(&[
            ("PORT", "4000"),
            ("ALLOWED_ORIGINS", "https://shop.example, https://admin.example ,"),
            ("STORE_BACKEND", "memory"),
            ("MESSAGE_LIMIT", "5"),
            ("TYPING_TIMEOUT_SECS", "3"),
        ]);
        assert_eq!(config.http_addr.port(), 4000);
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.message_limit, 5);
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("MESSAGE_LIMIT", "0"),
            ("RATE_WINDOW_SECS", "soon"),
            ("AUTH_ISSUER_PUBKEY", "abcd"),
        ]);
        assert_eq!(config.http_addr.port(), 3001);
        assert_eq!(config.message_limit, 60);
        assert_eq!(config.rate_window, Duration::from_secs(60));
        assert_eq!(config.auth_issuer_pubkey, [0u8; 32]);
    }

    #[test]
    fn test_parse_hex_pubkey() {
        let hex = "ab".repeat(32);
        let key = parse_hex_pubkey(&hex).unwrap();
        assert_eq!(key, [0xab; 32]);
        assert!(parse_hex_pubkey(&"zz".repeat(32)).is_err());
    }
}
