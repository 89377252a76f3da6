// Credential Resolver Service
// Resolves a user's stored platform connection into usable credentials

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{ChannelMetadata, PlatformConnection, TokenBlob};
use crate::services::{BroadcastError, DocumentStore, TokenCipher};

fn destination_path(uid: &str, platform: &str) -> String {
    format!("users/{uid}/destinations/{platform}")
}

fn destinations_collection(uid: &str) -> String {
    format!("users/{uid}/destinations")
}

/// Read-only resolver over the external credential store.
pub struct CredentialResolver {
    store: Arc<dyn DocumentStore>,
    cipher: Arc<TokenCipher>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn DocumentStore>, cipher: Arc<TokenCipher>) -> Self {
        Self { store, cipher }
    }

    /// Platforms the user has a stored connection record for.
    pub async fn list_platforms(&self, uid: &str) -> Result<Vec<String>, BroadcastError> {
        let entries = self
            .store
            .list(&destinations_collection(uid))
            .await
            .map_err(BroadcastError::Configuration)?;
        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }

    /// Resolve a usable, decrypted connection for `platform`.
    ///
    /// Fails with `NotConnected` when no record exists and with
    /// `MissingToken` when the record cannot produce a refresh token —
    /// including when the stored blob fails to decrypt, which signals the
    /// same "ask the user to reconnect" remedy.
    pub async fn resolve(
        &self,
        uid: &str,
        platform: &str,
    ) -> Result<PlatformConnection, BroadcastError> {
        let document = self
            .store
            .get(&destination_path(uid, platform))
            .await
            .map_err(BroadcastError::Configuration)?
            .ok_or_else(|| BroadcastError::NotConnected {
                platform: platform.to_string(),
            })?;

        let blob = document
            .get("tokens")
            .and_then(Value::as_str)
            .and_then(|serialized| self.cipher.decrypt_blob(serialized))
            .unwrap_or_else(|| {
                log::warn!("Stored {platform} token blob for user did not decrypt");
                TokenBlob::default()
            });

        if blob.refresh_token.as_deref().unwrap_or("").is_empty() {
            return Err(BroadcastError::MissingToken {
                platform: platform.to_string(),
            });
        }

        let channel: ChannelMetadata = document
            .get("channel")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        let expires_at = blob
            .expiry
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(PlatformConnection {
            platform_id: platform.to_string(),
            access_token: blob.access_token.clone(),
            refresh_token: blob.refresh_token.clone(),
            expires_at,
            scope: blob.scope.clone(),
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;
    use serde_json::json;

    fn resolver_with_store() -> (CredentialResolver, Arc<MemoryStore>, Arc<TokenCipher>) {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));
        let resolver = CredentialResolver::new(store.clone(), cipher.clone());
        (resolver, store, cipher)
    }

    async fn seed_connection(
        store: &MemoryStore,
        cipher: &TokenCipher,
        platform: &str,
        blob: &TokenBlob,
    ) {
        let tokens = cipher.encrypt_blob(blob).unwrap();
        store
            .set(
                &destination_path("u1", platform),
                json!({
                    "provider": platform,
                    "tokens": tokens,
                    "channel": { "id": "c1", "title": "Channel", "streamKey": "abc123" },
                }),
                false,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_record_is_not_connected() {
        let (resolver, _, _) = resolver_with_store();
        let error = resolver.resolve("u1", "youtube").await.unwrap_err();
        assert!(matches!(error, BroadcastError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_record_without_refresh_token_is_missing_token() {
        let (resolver, store, cipher) = resolver_with_store();
        let blob = TokenBlob {
            access_token: "token".to_string(),
            refresh_token: None,
            scope: None,
            expiry: None,
        };
        seed_connection(&store, &cipher, "youtube", &blob).await;

        let error = resolver.resolve("u1", "youtube").await.unwrap_err();
        assert!(matches!(error, BroadcastError::MissingToken { .. }));
    }

    #[tokio::test]
    async fn test_undecryptable_blob_is_missing_token() {
        let (resolver, store, _) = resolver_with_store();
        store
            .set(
                &destination_path("u1", "youtube"),
                json!({ "provider": "youtube", "tokens": "garbage" }),
                false,
            )
            .await
            .unwrap();

        let error = resolver.resolve("u1", "youtube").await.unwrap_err();
        assert!(matches!(error, BroadcastError::MissingToken { .. }));
    }

    #[tokio::test]
    async fn test_resolves_connection_with_channel_metadata() {
        let (resolver, store, cipher) = resolver_with_store();
        let blob = TokenBlob {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            scope: Some("scope".to_string()),
            expiry: Some(1_700_000_000_000),
        };
        seed_connection(&store, &cipher, "twitch", &blob).await;

        let connection = resolver.resolve("u1", "twitch").await.unwrap();
        assert_eq!(connection.access_token, "access");
        assert_eq!(connection.channel.stream_key.as_deref(), Some("abc123"));
        assert!(connection.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_list_platforms() {
        let (resolver, store, cipher) = resolver_with_store();
        let blob = TokenBlob {
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            scope: None,
            expiry: None,
        };
        seed_connection(&store, &cipher, "twitch", &blob).await;
        seed_connection(&store, &cipher, "youtube", &blob).await;

        let platforms = resolver.list_platforms("u1").await.unwrap();
        assert_eq!(platforms, vec!["twitch", "youtube"]);
    }
}
