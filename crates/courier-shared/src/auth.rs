use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::types::{Tier, UserId};

/// Claims asserted by the account service about a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: UserId,
    pub email: Option<String>,
    /// Tier known to the account service at issue time, if any.
    pub tier: Option<Tier>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// Token signed by the account service, presented once at socket handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub claims: AuthClaims,
    pub signature: Vec<u8>,
}

impl AuthToken {
    /// Sign `claims` with the account service key.
    pub fn issue(claims: AuthClaims, issuer: &SigningKey) -> Result<Self, AuthError> {
        let payload = bincode::serialize(&claims).map_err(|_| AuthError::Encoding)?;
        let signature = issuer.sign(&payload);
        Ok(Self {
            claims,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Encode the token as a base64url bearer string.
    pub fn encode(&self) -> Result<String, AuthError> {
        let bytes = bincode::serialize(self).map_err(|_| AuthError::Encoding)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(bearer: &str) -> Result<Self, AuthError> {
        let bearer = bearer.trim();
        if bearer.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(bearer)
            .map_err(|_| AuthError::InvalidFormat)?;
        bincode::deserialize(&bytes).map_err(|_| AuthError::InvalidFormat)
    }

    /// Check expiry, the issuer signature and the user id shape, returning
    /// the claims.
    pub fn verify(&self, issuer_pubkey: &[u8; 32]) -> Result<&AuthClaims, AuthError> {
        if Utc::now() > self.claims.expires_at {
            return Err(AuthError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| AuthError::InvalidSignature)?;
        let payload =
            bincode::serialize(&self.claims).map_err(|_| AuthError::InvalidFormat)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| AuthError::InvalidSignature)?;

        verifying_key
            .verify(&payload, &signature)
            .map_err(|_| AuthError::InvalidSignature)?;
        if !self.claims.user_id.fits_direct_id() {
            return Err(AuthError::InvalidUserId);
        }
        Ok(&self.claims)
    }
}

/// Decode and verify a bearer string in one step.
pub fn verify_bearer(bearer: &str, issuer_pubkey: &[u8; 32]) -> Result<AuthClaims, AuthError> {
    let token = AuthToken::decode(bearer)?;
    token.verify(issuer_pubkey).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::OsRng;

    fn claims(valid_for: Duration) -> AuthClaims {
        claims_for("user-1", valid_for)
    }

    fn claims_for(user: &str, valid_for: Duration) -> AuthClaims {
        let now = Utc::now();
        AuthClaims {
            user_id: user.into(),
            email: Some("user@example.com".into()),
            tier: Some(Tier::Gold),
            issued_at: now,
            expires_at: now + valid_for,
        }
    }

    #[test]
    fn test_token_valid() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let bearer = AuthToken::issue(claims(Duration::hours(1)), &issuer)
            .unwrap()
            .encode()
            .unwrap();

        let verified = verify_bearer(&bearer, &pubkey).unwrap();
        assert_eq!(verified.user_id.as_str(), "user-1");
        assert_eq!(verified.tier, Some(Tier::Gold));
    }

    #[test]
    fn test_token_expired() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let bearer = AuthToken::issue(claims(Duration::hours(-1)), &issuer)
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(verify_bearer(&bearer, &pubkey), Err(AuthError::Expired));
    }

    #[test]
    fn test_token_wrong_issuer_key() {
        let issuer = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let bearer = AuthToken::issue(claims(Duration::hours(1)), &issuer)
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(
            verify_bearer(&bearer, &other.verifying_key().to_bytes()),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_token_tampered_claims() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let mut token = AuthToken::issue(claims(Duration::hours(1)), &issuer).unwrap();
        token.claims.user_id = "someone-else".into();
        assert_eq!(
            verify_bearer(&token.encode().unwrap(), &pubkey),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_missing_and_garbage_tokens() {
        let pubkey = [0u8; 32];
        assert_eq!(verify_bearer("", &pubkey), Err(AuthError::MissingToken));
        assert_eq!(verify_bearer("%%%", &pubkey), Err(AuthError::InvalidFormat));
    }

    #[test]
    fn test_underscore_user_id_rejected() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let bearer = AuthToken::issue(claims_for("alice_smith", Duration::hours(1)), &issuer)
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(verify_bearer(&bearer, &pubkey), Err(AuthError::InvalidUserId));
    }
}
