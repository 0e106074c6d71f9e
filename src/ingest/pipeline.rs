//! Ingest pipeline
//!
//! Single write path: raw event → normalize → `MessageStore::put`, with
//! failure classification on the way out.
//!
//! - Malformed events are rejected and logged; retrying cannot help.
//! - Conflicts (edits to tombstones) surface to the caller unchanged.
//! - Transient store failures are retried with bounded exponential backoff.
//!   When the attempts run out, or the event targets a message not stored
//!   yet, the raw event is parked for replay.
//!
//! Store calls are blocking and run on the tokio blocking pool.

use super::source::EventSource;
use crate::cancel::CancellationToken;
use crate::config::IngestConfig;
use crate::model::Collection;
use crate::normalize::{normalize_str, MalformedEventError, NormalizedEvent};
use crate::storage::{MessageStore, StorageError, WriteMode, WriteOutcome};
use backoff::ExponentialBackoff;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the pipeline
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed event: {0}")]
    Malformed(#[from] MalformedEventError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("reading from source failed: {0}")]
    Source(#[from] std::io::Error),
}

/// What happened to one ingested event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Committed along with its audit entry
    Stored(WriteOutcome),
    /// Already stored; nothing changed
    Duplicate {
        collection: Collection,
        existing_id: String,
    },
    /// Set aside for replay
    Parked {
        parked_id: i64,
        attempts: u32,
        reason: String,
    },
}

impl From<WriteOutcome> for IngestOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Duplicate {
                collection,
                existing_id,
            } => Self::Duplicate {
                collection,
                existing_id,
            },
            applied => Self::Stored(applied),
        }
    }
}

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            // Bounded by attempt count instead
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

/// A store failure after the retry budget was spent
#[derive(Debug)]
struct Exhausted {
    error: StorageError,
    attempts: u32,
}

/// Counts from a source run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub received: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub conflicts: u64,
    pub parked: u64,
    /// Whether the run stopped on cancellation before the source ended
    pub cancelled: bool,
}

/// Counts from a parked-event replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: u64,
    pub duplicates: u64,
    /// Left parked: still failing
    pub still_parked: u64,
    /// Left parked: conflicts with the stored message, e.g. an edit
    /// whose target was deleted while the edit waited
    pub conflicts: u64,
    /// Left parked: can never be normalized
    pub malformed: u64,
}

/// The ingest pipeline
///
/// Cheap to share: wrap in an `Arc` and call from any task.
pub struct IngestPipeline {
    store: Arc<dyn MessageStore>,
    policy: RetryPolicy,
    actor: String,
    log_events: bool,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn MessageStore>, actor: impl Into<String>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            actor: actor.into(),
            log_events: false,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Log every stored event at debug level
    pub fn with_event_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Ingest one raw event
    ///
    /// `source` names where the event came from and is kept with it if
    /// it ends up parked.
    pub async fn ingest(&self, source: &str, raw: &str) -> Result<IngestOutcome, IngestError> {
        self.ingest_with_mode(source, raw, WriteMode::Normal).await
    }

    pub async fn ingest_with_mode(
        &self,
        source: &str,
        raw: &str,
        mode: WriteMode,
    ) -> Result<IngestOutcome, IngestError> {
        let record = match normalize_str(raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(source, error = %e, "rejected malformed event");
                return Err(e.into());
            }
        };

        match self.deliver(record, mode).await? {
            Ok(outcome) => Ok(outcome.into()),
            Err(exhausted) => {
                let reason = exhausted.error.to_string();
                let parked_id = self.park(source, raw, &reason, exhausted.attempts).await?;
                tracing::warn!(
                    source,
                    parked_id,
                    attempts = exhausted.attempts,
                    reason = %reason,
                    "parked event"
                );
                Ok(IngestOutcome::Parked {
                    parked_id,
                    attempts: exhausted.attempts,
                    reason,
                })
            }
        }
    }

    /// Ingest every event from `source` until it ends or `cancel` fires
    ///
    /// Events are processed in arrival order. Per-event failures are
    /// logged and counted; only a failing source or store aborts the run.
    pub async fn run(
        &self,
        source: &mut dyn EventSource,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        self.run_with_mode(source, cancel, WriteMode::Normal).await
    }

    pub async fn run_with_mode(
        &self,
        source: &mut dyn EventSource,
        cancel: &CancellationToken,
        mode: WriteMode,
    ) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();
        let name = source.name().to_string();

        loop {
            // Reads are cancel-safe, so an idle source can be abandoned mid-wait
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                next = source.next_event() => next?,
            };
            let Some(raw) = next else {
                break;
            };
            summary.received += 1;

            match self.ingest_with_mode(&name, &raw, mode).await {
                Ok(IngestOutcome::Stored(_)) => summary.stored += 1,
                Ok(IngestOutcome::Duplicate { .. }) => summary.duplicates += 1,
                Ok(IngestOutcome::Parked { .. }) => summary.parked += 1,
                Err(IngestError::Malformed(_)) => summary.rejected += 1,
                Err(IngestError::Storage(e @ StorageError::Conflict { .. })) => {
                    tracing::warn!(source = %name, error = %e, "event conflicts with stored state");
                    summary.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            source = %name,
            received = summary.received,
            stored = summary.stored,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            conflicts = summary.conflicts,
            parked = summary.parked,
            "ingest run finished"
        );
        Ok(summary)
    }

    /// Retry parked events, oldest first
    ///
    /// An event leaves the parking lot once it is stored or found to be a
    /// duplicate. Anything else stays parked with the latest failure
    /// recorded as its reason; one bad entry never stops the rest of the
    /// batch. Only a store that refuses this principal, or a failed store
    /// task, aborts the replay.
    pub async fn replay_parked(&self, limit: usize, mode: WriteMode) -> Result<ReplayReport, IngestError> {
        let store = self.store.clone();
        let parked = tokio::task::spawn_blocking(move || store.parked(limit)).await??;
        let mut report = ReplayReport::default();

        for entry in parked {
            let record = match normalize_str(&entry.raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(parked_id = entry.id, error = %e, "parked event is malformed");
                    report.malformed += 1;
                    continue;
                }
            };
            let (error, attempts) = match self.deliver(record, mode).await {
                Ok(Ok(outcome)) => {
                    if outcome.is_applied() {
                        report.replayed += 1;
                    } else {
                        report.duplicates += 1;
                    }
                    let store = self.store.clone();
                    tokio::task::spawn_blocking(move || store.unpark(entry.id)).await??;
                    tracing::info!(parked_id = entry.id, "replayed parked event");
                    continue;
                }
                Ok(Err(exhausted)) => {
                    report.still_parked += 1;
                    (exhausted.error, exhausted.attempts)
                }
                Err(IngestError::Storage(e @ StorageError::Conflict { .. })) => {
                    report.conflicts += 1;
                    (e, 1)
                }
                Err(IngestError::Storage(e)) if !matches!(e, StorageError::PermissionDenied { .. }) => {
                    report.still_parked += 1;
                    (e, 1)
                }
                Err(fatal) => return Err(fatal),
            };

            tracing::warn!(parked_id = entry.id, error = %error, "parked event still failing");
            let store = self.store.clone();
            let reason = error.to_string();
            tokio::task::spawn_blocking(move || store.requeue_parked(entry.id, &reason, attempts)).await??;
        }
        Ok(report)
    }

    /// Put with retries
    ///
    /// The outer `Result` carries failures that must surface (conflicts,
    /// permission problems, task panics); the inner one carries failures
    /// that warrant parking.
    async fn deliver(
        &self,
        record: NormalizedEvent,
        mode: WriteMode,
    ) -> Result<Result<WriteOutcome, Exhausted>, IngestError> {
        let record = Arc::new(record);
        let attempts = AtomicU32::new(0);
        let max_attempts = self.policy.max_attempts;

        let result = backoff::future::retry_notify(
            self.policy.backoff(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let store = self.store.clone();
                let record = record.clone();
                let actor = self.actor.clone();
                async move {
                    let put = match tokio::task::spawn_blocking(move || store.put(&record, &actor, mode)).await {
                        Ok(put) => put,
                        Err(e) => return Err(backoff::Error::permanent(Err(IngestError::Task(e)))),
                    };
                    match put {
                        Ok(outcome) => Ok(outcome),
                        Err(e) if e.is_transient() && attempt < max_attempts => {
                            Err(backoff::Error::transient(Ok(e)))
                        }
                        Err(e) => Err(backoff::Error::permanent(Ok(e))),
                    }
                }
            },
            |failure: Result<StorageError, IngestError>, wait: Duration| {
                if let Ok(e) = &failure {
                    tracing::debug!(error = %e, ?wait, "transient store failure; retrying");
                }
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(outcome) => {
                if self.log_events {
                    tracing::debug!(event_id = %record.event.id, ?outcome, attempts, "stored event");
                }
                Ok(Ok(outcome))
            }
            Err(Err(fatal)) => Err(fatal),
            Err(Ok(error)) if error.is_transient() || matches!(error, StorageError::MissingTarget(_)) => {
                Ok(Err(Exhausted { error, attempts }))
            }
            Err(Ok(error)) => Err(IngestError::Storage(error)),
        }
    }

    async fn park(&self, source: &str, raw: &str, reason: &str, attempts: u32) -> Result<i64, IngestError> {
        let store = self.store.clone();
        let (source, raw, reason) = (source.to_string(), raw.to_string(), reason.to_string());
        let id = tokio::task::spawn_blocking(move || store.park(&source, &raw, &reason, attempts)).await??;
        Ok(id)
    }
}
