//! Message body encryption.
//!
//! `seal` encrypts a plaintext for one recipient public key using an
//! ephemeral X25519 key agreement, a BLAKE3-derived key and
//! XChaCha20-Poly1305. The ciphertext carries the ephemeral public key
//! so only the recipient's secret is needed to `open` it. Senders seal
//! every message twice: once for the recipient and once for their own
//! key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_MESSAGE_KEY, NONCE_SIZE, PUBKEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// A user's long-term X25519 keypair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &public_key_to_base64(&self.public))
            .finish_non_exhaustive()
    }
}

/// Base64 ciphertext and nonce as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn public_key_to_base64(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let arr: [u8; PUBKEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(PublicKey::from(arr))
}

// BLAKE3 KDF with domain separation over the agreement transcript
fn derive_message_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s secret
/// can read it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Sealed, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_message_key(shared.as_bytes(), &ephemeral_public, recipient);

    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce_bytes = generate_nonce();
    let body = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    // ephemeral public key || AEAD ciphertext
    let mut output = Vec::with_capacity(PUBKEY_SIZE + body.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&body);

    Ok(Sealed {
        ciphertext: BASE64.encode(output),
        nonce: BASE64.encode(nonce_bytes),
    })
}

/// Decrypt a body sealed for `keypair`'s public key.
pub fn open(ciphertext: &str, nonce: &str, keypair: &KeyPair) -> Result<Vec<u8>, CryptoError> {
    let data = BASE64
        .decode(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce_bytes = BASE64
        .decode(nonce)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if data.len() < PUBKEY_SIZE || nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, body) = data.split_at(PUBKEY_SIZE);
    let mut eph = [0u8; PUBKEY_SIZE];
    eph.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(eph);

    let shared = keypair.secret.diffie_hellman(&ephemeral_public);
    let key = derive_message_key(shared.as_bytes(), &ephemeral_public, &keypair.public);

    let cipher = XChaCha20Poly1305::new((&key).into());
    cipher
        .decrypt(XNonce::from_slice(&nonce_bytes), body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Decrypt to UTF-8 text.
pub fn open_text(ciphertext: &str, nonce: &str, keypair: &KeyPair) -> Result<String, CryptoError> {
    let bytes = open(ciphertext, nonce, keypair)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed)
}
