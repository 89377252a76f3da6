// Error taxonomy for broadcast platform calls.
// Failures are classified structurally (HTTP status + machine-readable
// reason) before any message-text matching happens.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::models::LifecycleStatus;

/// Normalized failure from a platform API call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    /// Machine-readable reason from the response body, e.g. `quotaExceeded`.
    pub reason: Option<String>,
    /// HTTP status, absent for transport-level failures.
    pub status: Option<u16>,
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
            status: None,
        }
    }
}

/// How a failed call should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient upstream trouble, safe to repeat the same call.
    Retryable,
    /// Repeating the call will not help.
    Permanent,
    /// The remote object may simply not have caught up yet; re-read the
    /// authoritative state before retrying.
    NeedsReconciliation,
}

const RETRYABLE_REASONS: &[&str] = &[
    "backendError",
    "quotaExceeded",
    "rateLimitExceeded",
    "internalError",
];

const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

const RECONCILE_REASONS: &[&str] = &["forbidden", "invalidTransition"];

/// Fallback text match for platforms that report "not ready yet" without a
/// usable reason code. Only consulted when structural classification has
/// already landed on a reconcile-shaped reason.
fn looks_not_ready_yet(message: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)not\s+(yet\s+)?(active|ready|in\s+the)|inactive|invalid\s+transition")
            .expect("static pattern")
    });
    pattern.is_match(message)
}

/// Classify a platform failure.
///
/// Reason codes win over status codes. A failure with neither is a
/// transport-level problem and treated as retryable.
pub fn classify_api_error(error: &ApiError) -> RetryClass {
    if let Some(reason) = error.reason.as_deref() {
        if RETRYABLE_REASONS.contains(&reason) {
            return RetryClass::Retryable;
        }
        if RECONCILE_REASONS.contains(&reason) && looks_not_ready_yet(&error.message) {
            return RetryClass::NeedsReconciliation;
        }
    }
    match error.status {
        Some(status) if RETRYABLE_STATUSES.contains(&status) => RetryClass::Retryable,
        Some(_) => RetryClass::Permanent,
        None => RetryClass::Retryable,
    }
}

/// Top-level failure surfaced to HTTP handlers and session callers.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No {platform} connection for this account")]
    NotConnected { platform: String },

    #[error("Stored {platform} credentials are unusable, reconnect the account")]
    MissingToken { platform: String },

    #[error("Platform quota exceeded")]
    QuotaExceeded,

    #[error("Upstream error: {0}")]
    UpstreamTransient(ApiError),

    #[error("Upstream error: {0}")]
    UpstreamPermanent(ApiError),

    #[error("Transition failed: {message}")]
    Transition {
        message: String,
        reason: Option<String>,
        /// Last authoritative status observed before giving up.
        snapshot: LifecycleStatus,
        retryable: bool,
    },
}

impl BroadcastError {
    pub fn from_api(error: ApiError) -> Self {
        if error.reason.as_deref() == Some("quotaExceeded") {
            return Self::QuotaExceeded;
        }
        match classify_api_error(&error) {
            RetryClass::Permanent => Self::UpstreamPermanent(error),
            _ => Self::UpstreamTransient(error),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTransient(_) | Self::QuotaExceeded => true,
            Self::Transition { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Configuration(_) => 500,
            Self::Authentication(_) => 401,
            Self::NotConnected { .. } => 404,
            Self::MissingToken { .. } => 400,
            Self::QuotaExceeded => 429,
            Self::UpstreamTransient(api) | Self::UpstreamPermanent(api) => {
                api.status.unwrap_or(502)
            }
            Self::Transition { .. } => 502,
        }
    }
}

/// Wire shape for failed transition responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_status: Option<LifecycleStatus>,
}
