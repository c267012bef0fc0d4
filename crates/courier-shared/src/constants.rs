/// Protocol version advertised by `/info`
pub const PROTOCOL_VERSION: &str = "/courier/1.0.0";

/// Application name
pub const APP_NAME: &str = "Courier";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Prefix of every direct (two-party) conversation id
pub const DIRECT_PREFIX: &str = "direct_";

/// Room name prefixes
pub const USER_ROOM_PREFIX: &str = "user:";
pub const CONVERSATION_ROOM_PREFIX: &str = "conversation:";
pub const TIER_ROOM_PREFIX: &str = "tier:";

/// Messages allowed per user per rate window
pub const MESSAGE_LIMIT: u32 = 60;

/// Rate window length in seconds
pub const RATE_WINDOW_SECS: u64 = 60;

/// Typing indicator auto-expiry in seconds
pub const TYPING_TIMEOUT_SECS: u64 = 10;

/// Recording indicator auto-expiry in seconds
pub const RECORDING_TIMEOUT_SECS: u64 = 60;

/// Messages carried by a `conversation:snapshot` event
pub const SNAPSHOT_LIMIT: usize = 100;

/// Avatar used when the profile lookup fails
pub const DEFAULT_AVATAR_URL: &str = "/images/default-avatar.png";

/// Shown in place of a message body that cannot be decrypted
pub const DECRYPTION_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Prefix of ids synthesized when the durable store refuses a write
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Prefix of ids generated by clients for optimistic inserts
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3001;

/// Key derivation context (BLAKE3) for sealed message bodies
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "courier-message-key-v1";
