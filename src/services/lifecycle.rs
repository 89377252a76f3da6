// Broadcast Lifecycle State Machine
// Drives a remote broadcast through created → testing → live → complete

use std::time::Instant;

use log::{info, warn};
use tokio::time::{sleep, Duration};

use crate::models::LifecycleStatus;
use crate::services::{classify_api_error, BroadcastApi, BroadcastError, RetryClass};

/// Retry and polling knobs. Defaults are the production values; tests run
/// with zero delays.
#[derive(Debug, Clone)]
pub struct LifecycleTunables {
    /// Attempt ceiling for the whole creation sequence.
    pub create_attempts: u32,
    /// Base delay for linear creation backoff (attempt × base).
    pub create_backoff_base: Duration,
    /// Per-step attempt ceiling when the remote object has not caught up.
    pub transition_attempts: u32,
    /// Base delay for linear per-step backoff.
    pub transition_backoff_base: Duration,
    pub poll_interval: Duration,
    /// Poll budget after creation; expiry is non-fatal.
    pub create_poll_timeout: Duration,
    /// Poll budget after a testing transition en route to live.
    pub transition_poll_timeout: Duration,
}

impl Default for LifecycleTunables {
    fn default() -> Self {
        Self {
            create_attempts: 3,
            create_backoff_base: Duration::from_secs(1),
            transition_attempts: 8,
            transition_backoff_base: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            create_poll_timeout: Duration::from_secs(20),
            transition_poll_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a successful creation sequence.
#[derive(Debug, Clone)]
pub struct StartedBroadcast {
    pub broadcast_id: String,
    pub stream_id: String,
    pub ingestion_address: String,
    pub stream_name: String,
    pub lifecycle_status: LifecycleStatus,
}

/// Compute the minimal ordered transition sequence from `current` to
/// `desired`.
///
/// Never regresses: requesting a status the broadcast is already at or past
/// yields an empty plan. At most two steps are ever needed.
pub fn plan_transitions(
    current: LifecycleStatus,
    desired: LifecycleStatus,
) -> Vec<LifecycleStatus> {
    use LifecycleStatus::*;

    match desired {
        Complete => {
            if current == Complete {
                vec![]
            } else {
                vec![Complete]
            }
        }
        Live => match current {
            Unknown | Created => vec![Testing, Live],
            Testing => vec![Live],
            Live | Complete => vec![],
        },
        Testing => match current {
            Unknown | Created => vec![Testing],
            Testing | Live | Complete => vec![],
        },
        // Not reachable through the API surface.
        Unknown | Created => vec![],
    }
}

/// Platform-specific lifecycle driver for remote broadcast objects.
pub struct LifecycleMachine<A: BroadcastApi> {
    api: A,
    tunables: LifecycleTunables,
}

impl<A: BroadcastApi> LifecycleMachine<A> {
    pub fn new(api: A) -> Self {
        Self::with_tunables(api, LifecycleTunables::default())
    }

    pub fn with_tunables(api: A, tunables: LifecycleTunables) -> Self {
        Self { api, tunables }
    }

    /// Create the remote stream and broadcast pair, bind them, and wait for
    /// an initial status snapshot.
    ///
    /// The whole sequence is retried up to the attempt ceiling with linear
    /// backoff, but only for retryable failures. Remote objects created by a
    /// failed attempt are deleted before the attempt is considered failed.
    pub async fn start_broadcast(&self, title: &str) -> Result<StartedBroadcast, BroadcastError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_start(title).await {
                Ok(started) => return Ok(started),
                Err(error) => {
                    if attempt >= self.tunables.create_attempts || !error.is_retryable() {
                        return Err(error);
                    }
                    let delay = self.tunables.create_backoff_base * attempt;
                    warn!(
                        "Broadcast creation attempt {attempt} failed ({error}), retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn try_start(&self, title: &str) -> Result<StartedBroadcast, BroadcastError> {
        let stream = self
            .api
            .insert_stream(title)
            .await
            .map_err(BroadcastError::from_api)?;

        let ingestion_address = stream.ingestion_address.clone().unwrap_or_default();
        let stream_name = stream.stream_name.clone().unwrap_or_default();
        if ingestion_address.is_empty() || stream_name.is_empty() {
            self.cleanup(Some(&stream.id), None).await;
            return Err(BroadcastError::Configuration(
                "YouTube did not return ingestion details".to_string(),
            ));
        }

        let broadcast_id = match self.api.insert_broadcast(title).await {
            Ok(id) => id,
            Err(error) => {
                self.cleanup(Some(&stream.id), None).await;
                return Err(BroadcastError::from_api(error));
            }
        };

        if let Err(error) = self.api.bind(&broadcast_id, &stream.id).await {
            self.cleanup(Some(&stream.id), Some(&broadcast_id)).await;
            return Err(BroadcastError::from_api(error));
        }

        // Non-fatal: a poll timeout leaves the status at Unknown rather than
        // failing a broadcast that was created successfully.
        let lifecycle_status = self
            .poll_concrete_status(&broadcast_id, self.tunables.create_poll_timeout)
            .await
            .unwrap_or(LifecycleStatus::Unknown);

        info!("Created broadcast {broadcast_id} bound to stream {} ({lifecycle_status:?})", stream.id);

        Ok(StartedBroadcast {
            broadcast_id,
            stream_id: stream.id,
            ingestion_address,
            stream_name,
            lifecycle_status,
        })
    }

    /// Delete whichever remote objects a failed creation attempt left
    /// behind. Best-effort: deletion failures are logged, not surfaced.
    async fn cleanup(&self, stream_id: Option<&str>, broadcast_id: Option<&str>) {
        if let Some(id) = broadcast_id {
            if let Err(error) = self.api.delete_broadcast(id).await {
                warn!("Failed to delete orphaned broadcast {id}: {error}");
            }
        }
        if let Some(id) = stream_id {
            if let Err(error) = self.api.delete_stream(id).await {
                warn!("Failed to delete orphaned stream {id}: {error}");
            }
        }
    }

    /// Drive the broadcast to `desired`, passing through any required
    /// intermediate states.
    ///
    /// Requesting the status the broadcast is already at (or past) is a
    /// no-op returning the authoritative status unchanged.
    pub async fn transition_broadcast(
        &self,
        broadcast_id: &str,
        desired: LifecycleStatus,
    ) -> Result<LifecycleStatus, BroadcastError> {
        let current = self
            .api
            .fetch_status(broadcast_id)
            .await
            .map_err(BroadcastError::from_api)?;

        if current == desired {
            return Ok(current);
        }

        let plan = plan_transitions(current, desired);
        if plan.is_empty() {
            return Ok(current);
        }

        let mut last_snapshot = current;
        let mut reached = current;
        for step in &plan {
            reached = self
                .apply_transition(broadcast_id, *step, &mut last_snapshot)
                .await?;

            // The testing state settles asynchronously; wait for the remote
            // side to report it before asking for live.
            if *step == LifecycleStatus::Testing && desired == LifecycleStatus::Live {
                reached = self
                    .poll_at_least(
                        broadcast_id,
                        LifecycleStatus::Testing,
                        self.tunables.transition_poll_timeout,
                    )
                    .await
                    .map_err(|snapshot| BroadcastError::Transition {
                        message: format!(
                            "Timed out waiting for broadcast {broadcast_id} to reach testing"
                        ),
                        reason: None,
                        snapshot,
                        retryable: true,
                    })?;
                last_snapshot = reached;
            }
        }

        Ok(reached)
    }

    /// Apply a single transition step, retrying only while the remote
    /// object has not caught up with an earlier call.
    async fn apply_transition(
        &self,
        broadcast_id: &str,
        step: LifecycleStatus,
        last_snapshot: &mut LifecycleStatus,
    ) -> Result<LifecycleStatus, BroadcastError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.api.transition(broadcast_id, step).await {
                Ok(status) => {
                    *last_snapshot = status;
                    return Ok(status);
                }
                Err(error) => error,
            };

            let class = classify_api_error(&error);

            // Reconcile against authoritative state: the remote side may
            // have raced ahead of the acknowledgment.
            if class == RetryClass::NeedsReconciliation {
                if let Ok(snapshot) = self.api.fetch_status(broadcast_id).await {
                    *last_snapshot = snapshot;
                    if snapshot.rank() >= step.rank() {
                        info!(
                            "Broadcast {broadcast_id} already reached {snapshot:?}, treating {step:?} as applied"
                        );
                        return Ok(snapshot);
                    }
                }

                if attempt < self.tunables.transition_attempts {
                    let delay = self.tunables.transition_backoff_base * attempt;
                    warn!(
                        "Broadcast {broadcast_id} not ready for {step:?} (attempt {attempt}), retrying in {delay:?}"
                    );
                    sleep(delay).await;
                    continue;
                }
            }

            return Err(BroadcastError::Transition {
                message: error.message.clone(),
                reason: error.reason.clone(),
                snapshot: *last_snapshot,
                retryable: class != RetryClass::Permanent,
            });
        }
    }

    /// Poll until the broadcast reports a concrete (non-unknown) status.
    /// On timeout the last observed status is returned as the error value.
    async fn poll_concrete_status(
        &self,
        broadcast_id: &str,
        timeout: Duration,
    ) -> Result<LifecycleStatus, LifecycleStatus> {
        self.poll_until(broadcast_id, timeout, |status| {
            status != LifecycleStatus::Unknown
        })
        .await
    }

    /// Poll until the broadcast reports a status at or past `floor`.
    async fn poll_at_least(
        &self,
        broadcast_id: &str,
        floor: LifecycleStatus,
        timeout: Duration,
    ) -> Result<LifecycleStatus, LifecycleStatus> {
        self.poll_until(broadcast_id, timeout, move |status| {
            status != LifecycleStatus::Unknown && status.rank() >= floor.rank()
        })
        .await
    }

    async fn poll_until(
        &self,
        broadcast_id: &str,
        timeout: Duration,
        accept: impl Fn(LifecycleStatus) -> bool,
    ) -> Result<LifecycleStatus, LifecycleStatus> {
        let deadline = Instant::now() + timeout;
        let mut last = LifecycleStatus::Unknown;
        loop {
            if let Ok(status) = self.api.fetch_status(broadcast_id).await {
                last = status;
                if accept(status) {
                    return Ok(status);
                }
            }
            if Instant::now() >= deadline {
                return Err(last);
            }
            sleep(self.tunables.poll_interval).await;
        }
    }
}
