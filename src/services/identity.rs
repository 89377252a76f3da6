// Identity Service
// Verifies bearer identity tokens issued by the external identity provider

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::services::BroadcastError;

type HmacSha256 = Hmac<Sha256>;

/// The identity provider contract: turn a bearer token into a user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_id_token(&self, token: &str) -> Result<String, BroadcastError>;
}

#[derive(Serialize, Deserialize)]
struct TokenClaims {
    uid: String,
    /// Expiry as a unix timestamp in seconds.
    exp: i64,
}

/// Stateless signed tokens: `base64url(claims) . base64url(hmac)`.
///
/// The token encodes its own expiry and is verified rather than looked up,
/// so there is no shared mutable session state to sweep and nothing is lost
/// across restarts.
pub struct SignedTokenVerifier {
    secret: Vec<u8>,
}

impl SignedTokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Mint a token for `uid` valid for `ttl_secs` seconds.
    pub fn mint(&self, uid: &str, ttl_secs: i64) -> Result<String, BroadcastError> {
        let claims = TokenClaims {
            uid: uid.to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| BroadcastError::Configuration(format!("Failed to encode claims: {e}")))?;
        let mac = self.sign(&payload);
        Ok(format!(
            "{}.{}",
            BASE64URL.encode(payload),
            BASE64URL.encode(mac)
        ))
    }

    fn verify(&self, token: &str) -> Result<String, BroadcastError> {
        let invalid = || BroadcastError::Authentication("Invalid authentication token".to_string());

        let (payload_b64, mac_b64) = token.split_once('.').ok_or_else(invalid)?;
        let payload = BASE64URL.decode(payload_b64).map_err(|_| invalid())?;
        let mac = BASE64URL.decode(mac_b64).map_err(|_| invalid())?;

        let expected = self.sign(&payload);
        if expected.ct_eq(&mac).unwrap_u8() != 1 {
            return Err(invalid());
        }

        let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
        if claims.exp < chrono::Utc::now().timestamp() {
            return Err(BroadcastError::Authentication(
                "Authentication token expired".to_string(),
            ));
        }

        Ok(claims.uid)
    }
}

#[async_trait]
impl IdentityProvider for SignedTokenVerifier {
    async fn verify_id_token(&self, token: &str) -> Result<String, BroadcastError> {
        if token.is_empty() {
            return Err(BroadcastError::Authentication(
                "Authentication is required".to_string(),
            ));
        }
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mint_and_verify_round_trip() {
        let verifier = SignedTokenVerifier::new("test-secret");
        let token = verifier.mint("user-1", 60).unwrap();
        assert_eq!(verifier.verify_id_token(&token).await.unwrap(), "user-1");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = SignedTokenVerifier::new("test-secret");
        let token = verifier.mint("user-1", -10).unwrap();
        assert!(verifier.verify_id_token(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let verifier = SignedTokenVerifier::new("test-secret");
        let token = verifier.mint("user-1", 60).unwrap();
        let (_, mac) = token.split_once('.').unwrap();
        let forged_claims = BASE64URL.encode(br#"{"uid":"user-2","exp":9999999999}"#);
        let forged = format!("{forged_claims}.{mac}");
        assert!(verifier.verify_id_token(&forged).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let minter = SignedTokenVerifier::new("secret-a");
        let verifier = SignedTokenVerifier::new("secret-b");
        let token = minter.mint("user-1", 60).unwrap();
        assert!(verifier.verify_id_token(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let verifier = SignedTokenVerifier::new("test-secret");
        assert!(verifier.verify_id_token("").await.is_err());
        assert!(verifier.verify_id_token("garbage").await.is_err());
    }
}
