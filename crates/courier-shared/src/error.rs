use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid encoding: {0}")]
    Encoding(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingToken,

    #[error("Malformed credential")]
    InvalidFormat,

    #[error("Credential signature is invalid")]
    InvalidSignature,

    #[error("Credential has expired")]
    Expired,

    #[error("User id cannot name a direct conversation")]
    InvalidUserId,

    #[error("Credential could not be encoded")]
    Encoding,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not an object")]
    NotAnObject,
}
