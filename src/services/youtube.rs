// YouTube API Client
// Live stream / broadcast objects on the YouTube Data API v3

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use crate::models::LifecycleStatus;
use crate::services::ApiError;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Scheduled auto-end horizon for a broadcast.
const BROADCAST_DURATION_HOURS: i64 = 2;

/// A remote ingest-capable stream object.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub ingestion_address: Option<String>,
    pub stream_name: Option<String>,
}

/// The platform operations the lifecycle machine drives.
///
/// A trait seam so the state machine can be exercised against a scripted
/// platform in tests.
#[async_trait]
pub trait BroadcastApi: Send + Sync {
    async fn insert_stream(&self, title: &str) -> Result<RemoteStream, ApiError>;
    async fn insert_broadcast(&self, title: &str) -> Result<String, ApiError>;
    async fn bind(&self, broadcast_id: &str, stream_id: &str) -> Result<(), ApiError>;
    async fn transition(
        &self,
        broadcast_id: &str,
        status: LifecycleStatus,
    ) -> Result<LifecycleStatus, ApiError>;
    async fn fetch_status(&self, broadcast_id: &str) -> Result<LifecycleStatus, ApiError>;
    async fn delete_stream(&self, stream_id: &str) -> Result<(), ApiError>;
    async fn delete_broadcast(&self, broadcast_id: &str) -> Result<(), ApiError>;
}

/// Real client, one instance per resolved user connection.
pub struct YouTubeApi {
    http_client: reqwest::Client,
    access_token: String,
}

impl YouTubeApi {
    pub fn new(http_client: reqwest::Client, access_token: String) -> Self {
        Self {
            http_client,
            access_token,
        }
    }

    /// Parse a non-success response body into a normalized [`ApiError`].
    async fn read_error(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        #[derive(Deserialize)]
        struct ErrorBody {
            error: ErrorDetail,
        }
        #[derive(Deserialize)]
        struct ErrorDetail {
            message: Option<String>,
            errors: Option<Vec<ErrorItem>>,
        }
        #[derive(Deserialize)]
        struct ErrorItem {
            reason: Option<String>,
        }

        let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
        let (message, reason) = match parsed {
            Some(parsed) => {
                let reason = parsed
                    .error
                    .errors
                    .and_then(|items| items.into_iter().next())
                    .and_then(|item| item.reason);
                let message = parsed
                    .error
                    .message
                    .unwrap_or_else(|| format!("YouTube API returned {status}"));
                (message, reason)
            }
            None => (format!("YouTube API returned {status}"), None),
        };

        error!("YouTube API error: {status} {message}");
        ApiError {
            message,
            reason,
            status: Some(status),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::read_error(response).await)
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[async_trait]
impl BroadcastApi for YouTubeApi {
    async fn insert_stream(&self, title: &str) -> Result<RemoteStream, ApiError> {
        let body = json!({
            "snippet": { "title": format!("{title} • Stream") },
            "cdn": {
                "ingestionType": "rtmp",
                "frameRate": "variable",
                "resolution": "variable",
            },
            "contentDetails": { "isReusable": false },
        });

        let response = self
            .http_client
            .post(format!("{API_BASE}/liveStreams"))
            .query(&[("part", "snippet,cdn,contentDetails")])
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveStreams.insert failed: {e}")))?;
        let response = Self::check(response).await?;

        #[derive(Deserialize)]
        struct StreamResponse {
            id: String,
            cdn: Option<Cdn>,
        }
        #[derive(Deserialize)]
        struct Cdn {
            #[serde(rename = "ingestionInfo")]
            ingestion_info: Option<IngestionInfo>,
        }
        #[derive(Deserialize)]
        struct IngestionInfo {
            #[serde(rename = "ingestionAddress")]
            ingestion_address: Option<String>,
            #[serde(rename = "streamName")]
            stream_name: Option<String>,
        }

        let data: StreamResponse = response
            .json()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to parse stream response: {e}")))?;

        let ingestion = data.cdn.and_then(|cdn| cdn.ingestion_info);
        Ok(RemoteStream {
            id: data.id,
            ingestion_address: ingestion.as_ref().and_then(|i| i.ingestion_address.clone()),
            stream_name: ingestion.and_then(|i| i.stream_name),
        })
    }

    async fn insert_broadcast(&self, title: &str) -> Result<String, ApiError> {
        let now = Utc::now();
        let body = json!({
            "snippet": {
                "title": title,
                "scheduledStartTime": now.to_rfc3339(),
                "scheduledEndTime": (now + Duration::hours(BROADCAST_DURATION_HOURS)).to_rfc3339(),
            },
            "contentDetails": {
                "enableAutoStart": true,
                "enableAutoStop": true,
            },
            "status": { "privacyStatus": "unlisted" },
        });

        let response = self
            .http_client
            .post(format!("{API_BASE}/liveBroadcasts"))
            .query(&[("part", "snippet,contentDetails,status")])
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveBroadcasts.insert failed: {e}")))?;
        let response = Self::check(response).await?;

        #[derive(Deserialize)]
        struct BroadcastResponse {
            id: String,
        }

        let data: BroadcastResponse = response
            .json()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to parse broadcast response: {e}")))?;
        Ok(data.id)
    }

    async fn bind(&self, broadcast_id: &str, stream_id: &str) -> Result<(), ApiError> {
        let response = self
            .http_client
            .post(format!("{API_BASE}/liveBroadcasts/bind"))
            .query(&[
                ("part", "id,contentDetails"),
                ("id", broadcast_id),
                ("streamId", stream_id),
            ])
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveBroadcasts.bind failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn transition(
        &self,
        broadcast_id: &str,
        status: LifecycleStatus,
    ) -> Result<LifecycleStatus, ApiError> {
        let response = self
            .http_client
            .post(format!("{API_BASE}/liveBroadcasts/transition"))
            .query(&[
                ("part", "status"),
                ("id", broadcast_id),
                ("broadcastStatus", status.as_api()),
            ])
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveBroadcasts.transition failed: {e}")))?;
        let response = Self::check(response).await?;

        #[derive(Deserialize)]
        struct TransitionResponse {
            status: Option<StatusDetail>,
        }
        #[derive(Deserialize)]
        struct StatusDetail {
            #[serde(rename = "lifeCycleStatus")]
            life_cycle_status: Option<String>,
        }

        let data: TransitionResponse = response.json().await.map_err(|e| {
            ApiError::transport(format!("Failed to parse transition response: {e}"))
        })?;

        Ok(data
            .status
            .and_then(|detail| detail.life_cycle_status)
            .map(|value| LifecycleStatus::from_api(&value))
            .unwrap_or(status))
    }

    async fn fetch_status(&self, broadcast_id: &str) -> Result<LifecycleStatus, ApiError> {
        let response = self
            .http_client
            .get(format!("{API_BASE}/liveBroadcasts"))
            .query(&[("part", "status"), ("id", broadcast_id)])
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveBroadcasts.list failed: {e}")))?;
        let response = Self::check(response).await?;

        #[derive(Deserialize)]
        struct ListResponse {
            items: Option<Vec<Item>>,
        }
        #[derive(Deserialize)]
        struct Item {
            status: Option<StatusDetail>,
        }
        #[derive(Deserialize)]
        struct StatusDetail {
            #[serde(rename = "lifeCycleStatus")]
            life_cycle_status: Option<String>,
        }

        let data: ListResponse = response
            .json()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to parse status response: {e}")))?;

        let item = data
            .items
            .and_then(|items| items.into_iter().next())
            .ok_or_else(|| ApiError {
                message: format!("Broadcast {broadcast_id} was not found"),
                reason: Some("liveBroadcastNotFound".to_string()),
                status: Some(404),
            })?;

        Ok(item
            .status
            .and_then(|detail| detail.life_cycle_status)
            .map(|value| LifecycleStatus::from_api(&value))
            .unwrap_or(LifecycleStatus::Unknown))
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), ApiError> {
        let response = self
            .http_client
            .delete(format!("{API_BASE}/liveStreams"))
            .query(&[("id", stream_id)])
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveStreams.delete failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_broadcast(&self, broadcast_id: &str) -> Result<(), ApiError> {
        let response = self
            .http_client
            .delete(format!("{API_BASE}/liveBroadcasts"))
            .query(&[("id", broadcast_id)])
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("liveBroadcasts.delete failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Best-effort revocation of a Google OAuth grant during disconnect.
pub async fn revoke_google_token(http_client: &reqwest::Client, token: &str) -> Result<(), ApiError> {
    let url = format!("{REVOKE_URL}?token={}", urlencoding::encode(token));
    let response = http_client
        .post(url)
        .send()
        .await
        .map_err(|e| ApiError::transport(format!("Token revocation failed: {e}")))?;

    if response.status().is_success() {
        info!("Revoked upstream Google OAuth grant");
        Ok(())
    } else {
        Err(YouTubeApi::read_error(response).await)
    }
}
