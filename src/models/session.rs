// BroadcastSession Model
// Per-go-live session state and derived ingest targets

use serde::{Deserialize, Serialize};

/// A platform's authoritative state for a remote broadcast object.
///
/// Transitions are monotonic: `testing` and `live` may be skipped when the
/// remote object is already past them, and `complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    /// No authoritative snapshot has been fetched yet.
    #[default]
    Unknown,
    Created,
    Testing,
    Live,
    Complete,
}

impl LifecycleStatus {
    /// Position in the lifecycle ordering; higher ranks are further along.
    pub fn rank(self) -> u8 {
        match self {
            LifecycleStatus::Unknown => 0,
            LifecycleStatus::Created => 1,
            LifecycleStatus::Testing => 2,
            LifecycleStatus::Live => 3,
            LifecycleStatus::Complete => 4,
        }
    }

    /// Map a platform-reported lifecycle string onto the local enum.
    ///
    /// YouTube reports intermediate states the local machine does not track
    /// ("ready", "testStarting", "liveStarting"); they collapse onto the
    /// state they lead out of or into.
    pub fn from_api(value: &str) -> Self {
        match value {
            "created" | "ready" => LifecycleStatus::Created,
            "testStarting" | "testing" => LifecycleStatus::Testing,
            "liveStarting" | "live" => LifecycleStatus::Live,
            "complete" | "revoked" => LifecycleStatus::Complete,
            _ => LifecycleStatus::Unknown,
        }
    }

    /// Wire name used by the platform transition API.
    pub fn as_api(self) -> &'static str {
        match self {
            LifecycleStatus::Unknown => "unknown",
            LifecycleStatus::Created => "created",
            LifecycleStatus::Testing => "testing",
            LifecycleStatus::Live => "live",
            LifecycleStatus::Complete => "complete",
        }
    }
}

/// One destination's state for a single go-live request.
///
/// YouTube sessions additionally own two remote objects (a stream and a
/// broadcast) whose lifetimes are torn down together on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSession {
    pub platform_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_broadcast_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,

    #[serde(default)]
    pub lifecycle_status: LifecycleStatus,
}

impl BroadcastSession {
    /// The full publish URL for this session, when it has one.
    pub fn ingest_url(&self) -> Option<String> {
        let address = self.ingestion_address.as_deref()?;
        match self.stream_name.as_deref() {
            Some(name) if !name.is_empty() => {
                Some(format!("{}/{}", address.trim_end_matches('/'), name))
            }
            _ => Some(address.to_string()),
        }
    }
}

/// The unit handed to the relay: one resolvable publish destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestTarget {
    pub platform: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
}

/// A user-supplied custom RTMP destination bypassing platform APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTarget {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_ordering() {
        let order = [
            LifecycleStatus::Unknown,
            LifecycleStatus::Created,
            LifecycleStatus::Testing,
            LifecycleStatus::Live,
            LifecycleStatus::Complete,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn test_from_api_collapses_intermediate_states() {
        assert_eq!(LifecycleStatus::from_api("ready"), LifecycleStatus::Created);
        assert_eq!(
            LifecycleStatus::from_api("testStarting"),
            LifecycleStatus::Testing
        );
        assert_eq!(
            LifecycleStatus::from_api("liveStarting"),
            LifecycleStatus::Live
        );
        assert_eq!(
            LifecycleStatus::from_api("somethingNew"),
            LifecycleStatus::Unknown
        );
    }

    #[test]
    fn test_ingest_url_joins_address_and_name() {
        let session = BroadcastSession {
            platform_id: "youtube".to_string(),
            remote_stream_id: Some("s1".to_string()),
            remote_broadcast_id: Some("b1".to_string()),
            ingestion_address: Some("rtmp://a.rtmp.youtube.com/live2/".to_string()),
            stream_name: Some("abcd-efgh".to_string()),
            lifecycle_status: LifecycleStatus::Created,
        };
        assert_eq!(
            session.ingest_url().unwrap(),
            "rtmp://a.rtmp.youtube.com/live2/abcd-efgh"
        );
    }

    #[test]
    fn test_ingest_url_none_without_address() {
        let session = BroadcastSession {
            platform_id: "youtube".to_string(),
            remote_stream_id: None,
            remote_broadcast_id: None,
            ingestion_address: None,
            stream_name: Some("abcd".to_string()),
            lifecycle_status: LifecycleStatus::Unknown,
        };
        assert!(session.ingest_url().is_none());
    }
}
