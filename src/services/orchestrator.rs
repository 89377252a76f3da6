// Broadcast Session Orchestrator
// Fans a go-live request out across connected platforms and folds the
// per-platform outcomes into one session summary

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::models::{
    BroadcastSession, IngestTarget, LifecycleStatus, ManualTarget, PlatformConnection,
};
use crate::services::{
    BroadcastError, CredentialResolver, DocumentStore, LifecycleMachine, LifecycleTunables,
    YouTubeApi,
};

pub const TWITCH_INGEST_URL: &str = "rtmp://live.twitch.tv/app";

/// What a platform handler produced for one destination.
pub enum IngestOutcome {
    /// A prepared session with a resolvable publish target.
    Target {
        session: BroadcastSession,
        target: IngestTarget,
    },
    /// Nothing to publish for this destination, not an error.
    Skip { detail: String },
    /// The destination could not be prepared.
    Fail(BroadcastError),
}

/// One platform's preparation logic.
///
/// Handlers that talk to a remote API do all of it here; handlers that only
/// derive a target from stored metadata never touch the network.
#[async_trait]
pub trait PlatformHandler: Send + Sync {
    fn platform_id(&self) -> &str;
    async fn prepare(&self, connection: &PlatformConnection, title: &str) -> IngestOutcome;
}

/// Creates and binds the remote broadcast objects, then derives the ingest
/// URL from what the platform reported.
pub struct YouTubeHandler {
    http_client: reqwest::Client,
    tunables: LifecycleTunables,
}

impl YouTubeHandler {
    pub fn new(http_client: reqwest::Client, tunables: LifecycleTunables) -> Self {
        Self {
            http_client,
            tunables,
        }
    }
}

#[async_trait]
impl PlatformHandler for YouTubeHandler {
    fn platform_id(&self) -> &str {
        "youtube"
    }

    async fn prepare(&self, connection: &PlatformConnection, title: &str) -> IngestOutcome {
        let api = YouTubeApi::new(self.http_client.clone(), connection.access_token.clone());
        let machine = LifecycleMachine::with_tunables(api, self.tunables.clone());

        let started = match machine.start_broadcast(title).await {
            Ok(started) => started,
            Err(error) => return IngestOutcome::Fail(error),
        };

        let session = BroadcastSession {
            platform_id: "youtube".to_string(),
            remote_stream_id: Some(started.stream_id),
            remote_broadcast_id: Some(started.broadcast_id.clone()),
            ingestion_address: Some(started.ingestion_address),
            stream_name: Some(started.stream_name.clone()),
            lifecycle_status: started.lifecycle_status,
        };

        match session.ingest_url() {
            Some(url) => IngestOutcome::Target {
                target: IngestTarget {
                    platform: "youtube".to_string(),
                    url,
                    broadcast_id: Some(started.broadcast_id),
                    stream_key: Some(started.stream_name),
                },
                session,
            },
            None => IngestOutcome::Fail(BroadcastError::Configuration(
                "YouTube session has no ingestion address".to_string(),
            )),
        }
    }
}

/// Derives the target from the stored channel stream key. No network calls.
pub struct TwitchHandler;

#[async_trait]
impl PlatformHandler for TwitchHandler {
    fn platform_id(&self) -> &str {
        "twitch"
    }

    async fn prepare(&self, connection: &PlatformConnection, _title: &str) -> IngestOutcome {
        let stream_key = connection
            .channel
            .stream_key
            .as_deref()
            .unwrap_or("")
            .to_string();
        if stream_key.is_empty() {
            return IngestOutcome::Fail(BroadcastError::Configuration(
                "Twitch connection has no stored stream key".to_string(),
            ));
        }
        IngestOutcome::Target {
            session: BroadcastSession {
                platform_id: "twitch".to_string(),
                remote_stream_id: None,
                remote_broadcast_id: None,
                ingestion_address: Some(TWITCH_INGEST_URL.to_string()),
                stream_name: Some(stream_key.clone()),
                lifecycle_status: LifecycleStatus::Unknown,
            },
            target: IngestTarget {
                platform: "twitch".to_string(),
                url: format!("{TWITCH_INGEST_URL}/{stream_key}"),
                broadcast_id: None,
                stream_key: Some(stream_key),
            },
        }
    }
}

/// One destination that could not be prepared.
#[derive(Debug)]
pub struct PlatformFailure {
    pub platform: String,
    pub error: BroadcastError,
}

/// Outcome of a go-live request. Partial success is success: the summary
/// carries every prepared session and resolvable target alongside the
/// per-platform failures.
#[derive(Debug, Default)]
pub struct GoLiveSummary {
    pub sessions: Vec<BroadcastSession>,
    pub targets: Vec<IngestTarget>,
    pub failures: Vec<PlatformFailure>,
    pub skipped: Vec<String>,
}

pub struct BroadcastOrchestrator {
    credentials: Arc<CredentialResolver>,
    store: Arc<dyn DocumentStore>,
    handlers: Vec<Arc<dyn PlatformHandler>>,
}

impl BroadcastOrchestrator {
    pub fn new(
        credentials: Arc<CredentialResolver>,
        store: Arc<dyn DocumentStore>,
        handlers: Vec<Arc<dyn PlatformHandler>>,
    ) -> Self {
        Self {
            credentials,
            store,
            handlers,
        }
    }

    fn handler_for(&self, platform: &str) -> Option<&Arc<dyn PlatformHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.platform_id() == platform)
    }

    /// Prepare ingest targets for every requested destination.
    ///
    /// An empty `destinations` list means every platform the user has a
    /// stored connection for. Platforms without a handler are skipped, and
    /// a request where nothing was preparable returns an empty summary with
    /// the per-platform failures listed.
    pub async fn go_live(
        &self,
        uid: &str,
        title: &str,
        destinations: &[String],
        manual_targets: &[ManualTarget],
    ) -> Result<GoLiveSummary, BroadcastError> {
        let requested = if destinations.is_empty() {
            self.credentials.list_platforms(uid).await?
        } else {
            destinations.to_vec()
        };

        let mut summary = GoLiveSummary::default();

        for platform in &requested {
            let handler = match self.handler_for(platform) {
                Some(handler) => handler,
                None => {
                    info!("Skipping destination {platform}: no handler");
                    summary.skipped.push(platform.clone());
                    continue;
                }
            };

            let connection = match self.credentials.resolve(uid, platform).await {
                Ok(connection) => connection,
                Err(error) => {
                    warn!("Could not resolve {platform} connection: {error}");
                    summary.failures.push(PlatformFailure {
                        platform: platform.clone(),
                        error,
                    });
                    continue;
                }
            };

            match handler.prepare(&connection, title).await {
                IngestOutcome::Target { session, target } => {
                    info!("Prepared {platform} ingest target");
                    summary.sessions.push(session);
                    summary.targets.push(target);
                }
                IngestOutcome::Skip { detail } => {
                    info!("Skipping {platform}: {detail}");
                    summary.skipped.push(platform.clone());
                }
                IngestOutcome::Fail(error) => {
                    warn!("Failed to prepare {platform}: {error}");
                    summary.failures.push(PlatformFailure {
                        platform: platform.clone(),
                        error,
                    });
                }
            }
        }

        for manual in manual_targets {
            let url = match manual.stream_key.as_deref() {
                Some(key) if !key.is_empty() => {
                    format!("{}/{}", manual.url.trim_end_matches('/'), key)
                }
                _ => manual.url.clone(),
            };
            summary.sessions.push(BroadcastSession {
                platform_id: "custom".to_string(),
                remote_stream_id: None,
                remote_broadcast_id: None,
                ingestion_address: Some(manual.url.clone()),
                stream_name: manual.stream_key.clone(),
                lifecycle_status: LifecycleStatus::Unknown,
            });
            summary.targets.push(IngestTarget {
                platform: "custom".to_string(),
                url,
                broadcast_id: None,
                stream_key: manual.stream_key.clone(),
            });
        }

        // Best-effort usage counter; a storage hiccup never fails a go-live.
        if !summary.targets.is_empty() {
            if let Err(error) =
                self.store.increment(&format!("users/{uid}"), "goLiveCount", 1).await
            {
                warn!("Failed to bump goLiveCount for user: {error}");
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenBlob;
    use crate::services::{MemoryStore, TokenCipher};
    use serde_json::json;

    async fn seed_twitch(store: &MemoryStore, cipher: &TokenCipher, stream_key: Option<&str>) {
        let blob = TokenBlob {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            scope: None,
            expiry: None,
        };
        let tokens = cipher.encrypt_blob(&blob).unwrap();
        let mut channel = json!({ "id": "c1", "title": "Channel" });
        if let Some(key) = stream_key {
            channel["streamKey"] = json!(key);
        }
        store
            .set(
                "users/u1/destinations/twitch",
                json!({ "provider": "twitch", "tokens": tokens, "channel": channel }),
                false,
            )
            .await
            .unwrap();
    }

    fn orchestrator(store: Arc<MemoryStore>, cipher: Arc<TokenCipher>) -> BroadcastOrchestrator {
        let credentials = Arc::new(CredentialResolver::new(store.clone(), cipher));
        BroadcastOrchestrator::new(
            credentials,
            store,
            vec![
                Arc::new(YouTubeHandler::new(
                    reqwest::Client::new(),
                    LifecycleTunables::default(),
                )),
                Arc::new(TwitchHandler),
            ],
        )
    }

    #[tokio::test]
    async fn test_partial_success_yields_connected_target_only() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));
        seed_twitch(&store, &cipher, Some("abc123")).await;

        let orchestrator = orchestrator(store, cipher);
        let destinations = vec!["youtube".to_string(), "twitch".to_string()];
        let summary = orchestrator
            .go_live("u1", "Title", &destinations, &[])
            .await
            .unwrap();

        assert_eq!(summary.targets.len(), 1);
        let target = &summary.targets[0];
        assert_eq!(target.platform, "twitch");
        assert_eq!(target.url, "rtmp://live.twitch.tv/app/abc123");
        assert_eq!(summary.sessions.len(), 1);
        assert_eq!(summary.sessions[0].platform_id, "twitch");

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].platform, "youtube");
        assert!(matches!(
            summary.failures[0].error,
            BroadcastError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_destinations_means_all_connected() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));
        seed_twitch(&store, &cipher, Some("abc123")).await;

        let orchestrator = orchestrator(store, cipher);
        let summary = orchestrator.go_live("u1", "Title", &[], &[]).await.unwrap();

        assert_eq!(summary.targets.len(), 1);
        assert_eq!(summary.targets[0].platform, "twitch");
        assert!(summary.failures.is_empty());
    }

    #[tokio::test]
    async fn test_twitch_without_stream_key_fails_that_platform() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));
        seed_twitch(&store, &cipher, None).await;

        let orchestrator = orchestrator(store, cipher);
        let destinations = vec!["twitch".to_string()];
        let summary = orchestrator
            .go_live("u1", "Title", &destinations, &[])
            .await
            .unwrap();

        assert!(summary.targets.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].platform, "twitch");
        assert!(matches!(
            summary.failures[0].error,
            BroadcastError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_platform_is_skipped_not_failed() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));

        let orchestrator = orchestrator(store, cipher);
        let destinations = vec!["facebook".to_string()];
        let summary = orchestrator
            .go_live("u1", "Title", &destinations, &[])
            .await
            .unwrap();

        assert!(summary.targets.is_empty());
        assert!(summary.sessions.is_empty());
        assert!(summary.failures.is_empty());
        assert_eq!(summary.skipped, vec!["facebook".to_string()]);
    }

    #[tokio::test]
    async fn test_manual_targets_become_custom_platform() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));

        let orchestrator = orchestrator(store, cipher);
        let manual = vec![ManualTarget {
            url: "rtmp://ingest.example.com/live".to_string(),
            stream_key: Some("secret".to_string()),
        }];
        let summary = orchestrator.go_live("u1", "Title", &[], &manual).await.unwrap();

        assert_eq!(summary.targets.len(), 1);
        assert_eq!(summary.targets[0].platform, "custom");
        assert_eq!(summary.targets[0].url, "rtmp://ingest.example.com/live/secret");
        assert_eq!(summary.sessions.len(), 1);
        assert_eq!(summary.sessions[0].platform_id, "custom");
    }

    #[tokio::test]
    async fn test_nothing_requested_yields_empty_summary() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));

        let orchestrator = orchestrator(store, cipher);
        let summary = orchestrator.go_live("u1", "Title", &[], &[]).await.unwrap();

        assert!(summary.targets.is_empty());
        assert!(summary.sessions.is_empty());
        assert!(summary.failures.is_empty());
        assert!(summary.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_go_live_bumps_usage_counter() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));
        seed_twitch(&store, &cipher, Some("abc123")).await;

        let orchestrator = orchestrator(store.clone(), cipher);
        orchestrator.go_live("u1", "Title", &[], &[]).await.unwrap();

        let user = store.get("users/u1").await.unwrap().unwrap();
        assert_eq!(user["goLiveCount"], json!(1));
    }

    #[tokio::test]
    async fn test_empty_go_live_leaves_usage_counter_alone() {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new("test-key"));

        let orchestrator = orchestrator(store.clone(), cipher);
        orchestrator.go_live("u1", "Title", &[], &[]).await.unwrap();

        assert!(store.get("users/u1").await.unwrap().is_none());
    }
}
