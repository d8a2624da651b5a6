//! Per-collection outcomes and the aggregated batch report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::canonical::canonical_hash_hex;
use super::collection::CollectionId;

/// Classification of a store-level failure, recorded on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The store could not be reached.
    StoreUnreachable,
    /// The collection does not exist (anymore).
    NotFound,
    /// A single fetch exceeded its timeout.
    Timeout,
    /// The store reported some other failure.
    Backend,
    /// Stored metadata could not be decoded into chunks.
    InvalidMetadata,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnreachable => write!(f, "store_unreachable"),
            Self::NotFound => write!(f, "not_found"),
            Self::Timeout => write!(f, "timeout"),
            Self::Backend => write!(f, "backend"),
            Self::InvalidMetadata => write!(f, "invalid_metadata"),
        }
    }
}

/// Final status of one collection in a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Chunk metadata fetched and pushed into the mapping index.
    Completed,
    /// The store kept failing after the retry budget was spent.
    Failed,
    /// Nothing to index; see [`SkipReason`].
    Skipped,
}

/// Why a collection was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The collection holds no chunk metadata.
    Empty,
    /// The collection disappeared between listing and fetch.
    NotFound,
    /// The batch was cancelled before this collection was started.
    Cancelled,
}

/// Result of processing one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    /// Collection id.
    pub collection_id: CollectionId,
    /// Position of the collection in enumeration order.
    pub sequence: usize,
    /// Final status.
    pub status: OutcomeStatus,
    /// Number of chunks fetched (0 unless completed).
    pub chunk_count: usize,
    /// Fetch attempts made (0 when never started).
    pub attempts: u32,
    /// Failure classification, for failed and not-found outcomes.
    pub error: Option<ErrorKind>,
    /// Last error message, for diagnostics.
    pub error_message: Option<String>,
    /// Reason for skipped outcomes.
    pub skip_reason: Option<SkipReason>,
}

impl CollectionOutcome {
    /// Outcome for a collection whose chunks were indexed.
    pub fn completed(collection_id: CollectionId, sequence: usize, chunk_count: usize, attempts: u32) -> Self {
        Self {
            collection_id,
            sequence,
            status: OutcomeStatus::Completed,
            chunk_count,
            attempts,
            error: None,
            error_message: None,
            skip_reason: None,
        }
    }

    /// Outcome for a collection that kept failing.
    pub fn failed(
        collection_id: CollectionId,
        sequence: usize,
        attempts: u32,
        error: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            collection_id,
            sequence,
            status: OutcomeStatus::Failed,
            chunk_count: 0,
            attempts,
            error: Some(error),
            error_message: Some(message.into()),
            skip_reason: None,
        }
    }

    /// Outcome for a skipped collection.
    pub fn skipped(collection_id: CollectionId, sequence: usize, attempts: u32, reason: SkipReason) -> Self {
        Self {
            collection_id,
            sequence,
            status: OutcomeStatus::Skipped,
            chunk_count: 0,
            attempts,
            error: (reason == SkipReason::NotFound).then_some(ErrorKind::NotFound),
            error_message: None,
            skip_reason: Some(reason),
        }
    }

    /// Outcome for a collection never started because the batch was cancelled.
    pub fn cancelled(collection_id: CollectionId, sequence: usize) -> Self {
        Self::skipped(collection_id, sequence, 0, SkipReason::Cancelled)
    }
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the report was finalized.
    pub finished_at: DateTime<Utc>,
    /// Number of collections accounted for.
    pub total: usize,
    /// Completed outcomes.
    pub completed: usize,
    /// Failed outcomes.
    pub failed: usize,
    /// Skipped outcomes (any reason).
    pub skipped: usize,
    /// Whether cancellation was triggered during the run.
    pub cancelled: bool,
    /// Outcomes in enumeration order.
    pub outcomes: Vec<CollectionOutcome>,
}

impl BatchReport {
    /// Finalize a report: restore enumeration order and count statuses.
    pub fn from_outcomes(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        mut outcomes: Vec<CollectionOutcome>,
        cancelled: bool,
    ) -> Self {
        outcomes.sort_by_key(|o| o.sequence);

        let count = |status| outcomes.iter().filter(|o| o.status == status).count();
        let completed = count(OutcomeStatus::Completed);
        let failed = count(OutcomeStatus::Failed);
        let skipped = count(OutcomeStatus::Skipped);

        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: outcomes.len(),
            completed,
            failed,
            skipped,
            cancelled,
            outcomes,
        }
    }

    /// Outcome for a collection, if it was part of the run.
    pub fn outcome(&self, collection_id: &CollectionId) -> Option<&CollectionOutcome> {
        self.outcomes.iter().find(|o| &o.collection_id == collection_id)
    }

    /// Outcomes skipped for the given reason.
    pub fn skipped_for(&self, reason: SkipReason) -> impl Iterator<Item = &CollectionOutcome> {
        self.outcomes.iter().filter(move |o| o.skip_reason == Some(reason))
    }

    /// Fingerprint of the ordered `(collection, status)` sequence.
    ///
    /// Independent of run id, timestamps, and attempt counts, so two runs over the
    /// same store state compare equal regardless of concurrency.
    pub fn fingerprint(&self) -> String {
        let entries: Vec<(&str, OutcomeStatus, Option<SkipReason>)> = self
            .outcomes
            .iter()
            .map(|o| (o.collection_id.as_str(), o.status, o.skip_reason))
            .collect();
        canonical_hash_hex(&entries)
    }

    /// Duration between start and finalization in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
