// PlatformConnection Model
// A user's stored connection to a streaming platform

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decrypted contents of the `tokens` blob stored with a connection record.
///
/// This is the only shape the token cipher ever encrypts or decrypts; it
/// matches the payload written by the OAuth callback flow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenBlob {
    pub access_token: String,

    /// Absent for connections granted without offline access. A connection
    /// without a refresh token cannot be used for broadcasting and the user
    /// must reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Access token expiry as a unix timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
}

/// Channel metadata snapshot stored beside the encrypted token blob.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    /// Pre-fetched static stream key. Populated for Twitch, absent for
    /// platforms whose ingest is minted per broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
}

/// A resolved, decrypted platform connection.
///
/// Owned by the user and mutated only by the external OAuth flow; the core
/// treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConnection {
    pub platform_id: String,

    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default)]
    pub channel: ChannelMetadata,
}
