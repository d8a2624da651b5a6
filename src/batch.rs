//! Bounded-concurrency collection processing.
//!
//! ## Algorithm
//!
//! 1. A feeder task pushes `(sequence, descriptor)` work items into a bounded queue,
//!    either from a supplied list or straight from a [`CollectionEnumerator`]
//! 2. `concurrency` worker tasks share the queue receiver; each dequeues one item at a
//!    time, fetches the collection's chunk metadata under the retry policy, and pushes
//!    the filenames into the [`MappingIndex`] before taking the next item
//! 3. On cancellation workers stop dequeuing; whatever is still queued, unsent, or not
//!    yet listed is reported as skipped with reason `Cancelled`
//! 4. Outcomes are sorted by sequence number, so report order is enumeration order
//!    regardless of which worker finished first
//!
//! A failing collection only produces a `Failed` outcome. Only a listing failure of
//! the enumerator ends the run early, and even then the outcomes gathered so far are
//! returned inside the error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::enumerator::{CollectionEnumerator, EnumerationError};
use crate::mapping::MappingIndex;
use crate::retry::RetryPolicy;
use crate::store::{CollectionStore, StoreError};
use crate::types::{
    BatchReport, ChunkFilter, CollectionDescriptor, CollectionOutcome, OutcomeStatus, SkipReason,
};

/// Batch processor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Default number of workers.
    pub concurrency: usize,
    /// Timeout for a single fetch attempt.
    pub fetch_timeout: Duration,
    /// Capacity of the work queue between feeder and workers.
    pub queue_depth: usize,
    /// Cancel the whole run after this long.
    pub batch_timeout: Option<Duration>,
    /// Retry policy for fetches.
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fetch_timeout: Duration::from_secs(30),
            queue_depth: 64,
            batch_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Workers default to the number of cores, capped at 20.
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 20)
}

impl BatchConfig {
    /// Load from environment variables with production defaults.
    ///
    /// - `REASSEMBLY_CONCURRENCY` (default: cores, max 20)
    /// - `REASSEMBLY_FETCH_TIMEOUT_SECS` (default: 30)
    /// - `REASSEMBLY_QUEUE_DEPTH` (default: 64)
    /// - `REASSEMBLY_BATCH_TIMEOUT_SECS` (default: none)
    /// - retry settings, see [`RetryPolicy::from_env`]
    pub fn from_env() -> Self {
        Self {
            concurrency: std::env::var("REASSEMBLY_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or_else(default_concurrency),
            fetch_timeout: std::env::var("REASSEMBLY_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
            queue_depth: std::env::var("REASSEMBLY_QUEUE_DEPTH")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(64),
            batch_timeout: std::env::var("REASSEMBLY_BATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs),
            retry: RetryPolicy::from_env(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the whole-run timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }
}

/// Errors that prevent a complete batch report.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A concurrency of zero was requested.
    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,
    /// The enumerator failed; `partial` holds every outcome gathered before that.
    #[error("Enumeration aborted after {} collections: {source}", .partial.total)]
    EnumerationAborted {
        /// Listing failure.
        source: EnumerationError,
        /// Report over the collections enumerated before the failure.
        partial: Box<BatchReport>,
    },
    /// A worker or feeder task panicked.
    #[error("Batch task failed: {0}")]
    TaskFailed(String),
    /// Another run is in progress on the same engine.
    #[error("A batch run is already in progress")]
    AlreadyRunning,
}

/// Live progress of the current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Whether a run is in progress.
    pub running: bool,
    /// Collections known so far (grows while enumerating).
    pub total: usize,
    /// Collections with a final outcome.
    pub processed: usize,
    /// Completed so far.
    pub completed: usize,
    /// Failed so far.
    pub failed: usize,
    /// Skipped so far.
    pub skipped: usize,
}

impl BatchProgress {
    /// Processed share in percent (100 when nothing is known).
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }

    /// Human-readable status line.
    pub fn status_line(&self) -> String {
        let state = if self.running { "processing" } else { "idle" };
        format!(
            "{state}: {}/{} ({:.1}%), {} completed, {} failed, {} skipped",
            self.processed,
            self.total,
            self.percent(),
            self.completed,
            self.failed,
            self.skipped
        )
    }
}

/// Lock-free counters behind [`BatchProgress`].
#[derive(Debug, Default)]
pub struct ProgressTracker {
    running: AtomicBool,
    total: AtomicUsize,
    processed: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl ProgressTracker {
    fn start(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    fn record(&self, status: OutcomeStatus) {
        let counter = match status {
            OutcomeStatus::Completed => &self.completed,
            OutcomeStatus::Failed => &self.failed,
            OutcomeStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current counters.
    pub fn snapshot(&self) -> BatchProgress {
        BatchProgress {
            running: self.running.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct WorkItem {
    sequence: usize,
    descriptor: CollectionDescriptor,
}

#[derive(Debug, Default)]
struct FeedEnd {
    unsent: Vec<WorkItem>,
    error: Option<EnumerationError>,
}

/// Everything a worker task needs, cloned into each task.
struct WorkerContext<S: CollectionStore + 'static> {
    store: Arc<S>,
    index: Arc<MappingIndex>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    progress: Arc<ProgressTracker>,
}

impl<S: CollectionStore + 'static> Clone for WorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            index: Arc::clone(&self.index),
            retry: self.retry.clone(),
            fetch_timeout: self.fetch_timeout,
            progress: Arc::clone(&self.progress),
        }
    }
}

impl<S: CollectionStore + 'static> WorkerContext<S> {
    async fn work(
        self,
        worker: usize,
        queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        cancel: CancelSignal,
    ) -> Vec<CollectionOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = queue.recv() => item,
                }
            };
            let Some(item) = next else { break };
            outcomes.push(self.process_one(item).await);
        }
        debug!(worker, processed = outcomes.len(), "worker finished");
        outcomes
    }

    async fn process_one(&self, item: WorkItem) -> CollectionOutcome {
        let WorkItem { sequence, descriptor } = item;
        let id = descriptor.id;
        let label = id.to_string();
        let filter = ChunkFilter::metadata_only();
        let timeout = self.fetch_timeout;

        let attempted = self
            .retry
            .run(&label, |_| {
                let store = Arc::clone(&self.store);
                let id = id.clone();
                let filter = filter.clone();
                async move {
                    match tokio::time::timeout(timeout, store.query_chunks(&id, &filter)).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout {
                            collection_id: id.clone(),
                            elapsed_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            })
            .await;
        let attempts = attempted.attempts;

        let outcome = match attempted.result {
            Ok(chunks) if chunks.is_empty() => {
                self.index.remove_collection(&id);
                debug!(collection = %id, sequence, "collection empty, skipped");
                CollectionOutcome::skipped(id, sequence, attempts, SkipReason::Empty)
            }
            Ok(chunks) => {
                self.index.replace_collection(&id, &chunks);
                debug!(collection = %id, sequence, chunks = chunks.len(), attempts, "collection indexed");
                CollectionOutcome::completed(id, sequence, chunks.len(), attempts)
            }
            Err(StoreError::NotFound(_)) => {
                self.index.remove_collection(&id);
                warn!(collection = %id, sequence, "collection vanished before fetch, skipped");
                CollectionOutcome::skipped(id, sequence, attempts, SkipReason::NotFound)
            }
            Err(error) => {
                warn!(collection = %id, sequence, attempts, error = %error, "collection failed");
                CollectionOutcome::failed(id, sequence, attempts, error.kind(), error.to_string())
            }
        };

        self.progress.record(outcome.status);
        outcome
    }
}

/// Processes collections through a bounded worker pool and feeds the mapping index.
pub struct BatchProcessor<S: CollectionStore + 'static> {
    store: Arc<S>,
    index: Arc<MappingIndex>,
    config: BatchConfig,
    progress: Arc<ProgressTracker>,
}

impl<S: CollectionStore + 'static> BatchProcessor<S> {
    /// Create a processor writing into `index`.
    pub fn new(store: Arc<S>, index: Arc<MappingIndex>, config: BatchConfig) -> Self {
        Self {
            store,
            index,
            config,
            progress: Arc::new(ProgressTracker::default()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Progress of the current or last run.
    pub fn progress(&self) -> BatchProgress {
        self.progress.snapshot()
    }

    /// Process a known list of collections.
    pub async fn process(
        &self,
        descriptors: Vec<CollectionDescriptor>,
        concurrency: usize,
    ) -> Result<BatchReport, BatchError> {
        self.process_with_cancel(descriptors, concurrency, &CancelSignal::new()).await
    }

    /// Process a known list of collections, stopping early when `cancel` fires.
    pub async fn process_with_cancel(
        &self,
        descriptors: Vec<CollectionDescriptor>,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<BatchReport, BatchError> {
        if concurrency == 0 {
            return Err(BatchError::InvalidConcurrency);
        }
        self.progress.start(descriptors.len());

        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            let mut pending = descriptors
                .into_iter()
                .enumerate()
                .map(|(sequence, descriptor)| WorkItem { sequence, descriptor });

            while let Some(item) = pending.next() {
                if feeder_cancel.is_cancelled() {
                    let mut unsent = vec![item];
                    unsent.extend(pending);
                    return FeedEnd { unsent, error: None };
                }
                if let Err(mpsc::error::SendError(item)) = tx.send(item).await {
                    let mut unsent = vec![item];
                    unsent.extend(pending);
                    return FeedEnd { unsent, error: None };
                }
            }
            FeedEnd::default()
        });

        self.drive(rx, feeder, concurrency, cancel).await
    }

    /// Enumerate and process every collection the enumerator yields.
    pub async fn run(
        &self,
        mut enumerator: CollectionEnumerator<S>,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<BatchReport, BatchError> {
        if concurrency == 0 {
            return Err(BatchError::InvalidConcurrency);
        }
        self.progress.start(0);

        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let feeder_cancel = cancel.clone();
        let progress = Arc::clone(&self.progress);
        let feeder = tokio::spawn(async move {
            let mut sequence = 0;
            let mut unsent = Vec::new();
            loop {
                // After cancellation the listing is still walked so every remaining
                // collection gets an outcome.
                let descriptor = match enumerator.next().await {
                    Ok(Some(descriptor)) => descriptor,
                    Ok(None) => return FeedEnd { unsent, error: None },
                    Err(error) => return FeedEnd { unsent, error: Some(error) },
                };
                progress.add_total(1);
                let item = WorkItem { sequence, descriptor };
                sequence += 1;
                if !unsent.is_empty() || feeder_cancel.is_cancelled() {
                    unsent.push(item);
                    continue;
                }
                if let Err(mpsc::error::SendError(item)) = tx.send(item).await {
                    unsent.push(item);
                }
            }
        });

        self.drive(rx, feeder, concurrency, cancel).await
    }

    async fn drive(
        &self,
        rx: mpsc::Receiver<WorkItem>,
        feeder: JoinHandle<FeedEnd>,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<BatchReport, BatchError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = self.config.batch_timeout.map(|timeout| cancel.cancel_after(timeout));
        info!(%run_id, concurrency, "batch run started");

        let context = WorkerContext {
            store: Arc::clone(&self.store),
            index: Arc::clone(&self.index),
            retry: self.config.retry.clone(),
            fetch_timeout: self.config.fetch_timeout,
            progress: Arc::clone(&self.progress),
        };
        let queue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let context = context.clone();
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            workers.spawn(async move { context.work(worker, queue, cancel).await });
        }

        let mut outcomes = Vec::new();
        let mut task_failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(mut worker_outcomes) => outcomes.append(&mut worker_outcomes),
                Err(e) => task_failure = Some(e.to_string()),
            }
        }

        // Whatever is still queued was never started.
        let mut never_started = Vec::new();
        {
            let mut queue = queue.lock().await;
            queue.close();
            while let Some(item) = queue.recv().await {
                never_started.push(item);
            }
        }

        let feed_end = feeder.await;
        if let Some(timer) = timer {
            timer.abort();
        }
        self.progress.finish();

        let feed_end = match (feed_end, task_failure) {
            (Ok(feed_end), None) => feed_end,
            (Err(e), _) => return Err(BatchError::TaskFailed(e.to_string())),
            (_, Some(message)) => return Err(BatchError::TaskFailed(message)),
        };

        never_started.extend(feed_end.unsent);
        for item in never_started {
            self.progress.record(OutcomeStatus::Skipped);
            outcomes.push(CollectionOutcome::cancelled(item.descriptor.id, item.sequence));
        }

        let report = BatchReport::from_outcomes(run_id, started_at, outcomes, cancel.is_cancelled());
        info!(
            %run_id,
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms(),
            "batch run finished"
        );

        match feed_end.error {
            Some(source) => {
                warn!(%run_id, error = %source, "enumeration aborted, returning partial report");
                Err(BatchError::EnumerationAborted {
                    source,
                    partial: Box::new(report),
                })
            }
            None => Ok(report),
        }
    }
}
