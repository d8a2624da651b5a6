//! Engine facade tying the batch processor, mapping index and reconstructor together.
//!
//! `ReassemblyEngine` is what callers and the HTTP service hold. It owns the shared
//! [`MappingIndex`], serializes batch runs, and adds the maintenance operations
//! (refresh, listing, inspection, deletion) on top of the core pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::batch::{BatchConfig, BatchError, BatchProcessor, BatchProgress};
use crate::cancel::CancelSignal;
use crate::enumerator::{CollectionEnumerator, EnumerationError, EnumeratorConfig};
use crate::mapping::{MappingIndex, MappingStats};
use crate::reconstructor::{FileReconstructor, ReconstructionError, ReconstructionOptions};
use crate::reuse::{CacheStats, ReuseCache, DEFAULT_REUSE_ENTRIES};
use crate::store::{CollectionStore, StoreError};
use crate::types::{
    BatchReport, ChunkFilter, CollectionDescriptor, CollectionId, EmbeddingConfig,
    ReconstructedFile,
};

/// Characters kept in a chunk preview.
pub const PREVIEW_CHARS: usize = 200;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Batch processor settings.
    pub batch: BatchConfig,
    /// Listing settings.
    pub enumerator: EnumeratorConfig,
    /// How long a refreshed index counts as fresh.
    pub mapping_ttl: Duration,
    /// Capacity of the reuse cache.
    pub reuse_cache_entries: usize,
    /// Assembly options.
    pub reconstruction: ReconstructionOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            enumerator: EnumeratorConfig::default(),
            mapping_ttl: Duration::from_secs(300),
            reuse_cache_entries: DEFAULT_REUSE_ENTRIES,
            reconstruction: ReconstructionOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables with production defaults.
    ///
    /// - `REASSEMBLY_MAPPING_TTL_SECS` (default: 300)
    /// - `REASSEMBLY_REUSE_CACHE_ENTRIES` (default: 256)
    /// - `REASSEMBLY_SEPARATOR` (default: empty, exact concatenation)
    /// - batch and listing settings, see [`BatchConfig::from_env`] and
    ///   [`EnumeratorConfig::from_env`]
    pub fn from_env() -> Self {
        Self {
            batch: BatchConfig::from_env(),
            enumerator: EnumeratorConfig::from_env(),
            mapping_ttl: std::env::var("REASSEMBLY_MAPPING_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
            reuse_cache_entries: std::env::var("REASSEMBLY_REUSE_CACHE_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REUSE_ENTRIES),
            reconstruction: std::env::var("REASSEMBLY_SEPARATOR")
                .map(|s| ReconstructionOptions::joined(s.replace("\\n", "\n")))
                .unwrap_or_default(),
        }
    }
}

/// Errors of the maintenance operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No collection is mapped to the filename.
    #[error("Unknown filename: {0}")]
    UnknownFilename(String),
    /// The collection holds no decodable chunks.
    #[error("Collection {0} is empty")]
    EmptyCollection(CollectionId),
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Listing failed.
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    /// The refresh batch failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Result of [`ReassemblyEngine::refresh_mapping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "refresh", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// The index was still fresh; no batch ran.
    Cached {
        /// Index summary.
        stats: MappingStats,
    },
    /// A batch run rebuilt the index.
    Refreshed {
        /// Report of that run.
        report: BatchReport,
    },
}

/// File information carried in chunk metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Original filename.
    pub filename: String,
    /// Source file id.
    pub file_id: Option<String>,
    /// Recorded content hash.
    pub content_hash: Option<String>,
    /// Source path.
    pub source: Option<String>,
    /// Declared number of chunks.
    pub total_chunks: u32,
    /// Embedding engine and model used at ingestion.
    pub embedding_config: Option<EmbeddingConfig>,
}

/// Short view of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPreview {
    /// Filename of the chunk.
    pub filename: String,
    /// Chunk index.
    pub chunk_index: u32,
    /// Payload length in bytes.
    pub length: usize,
    /// First characters of the payload.
    pub preview: String,
    /// Whether the preview was cut.
    pub truncated: bool,
}

/// Inspection result of [`ReassemblyEngine::describe_collection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSummary {
    /// Collection id.
    pub id: CollectionId,
    /// Collection name.
    pub name: String,
    /// Stored items.
    pub item_count: u64,
    /// Collection-level metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Embedding vector dimension, when the store reports it.
    pub dimension: Option<usize>,
    /// File info of the first chunk carrying a file id (else the first chunk).
    pub file: Option<FileInfo>,
    /// Distinct filenames stored in the collection.
    pub filenames: BTreeSet<String>,
    /// One preview per chunk, in `(filename, index)` order.
    pub segments: Vec<SegmentPreview>,
}

/// Whole content of one collection, from [`ReassemblyEngine::reconstruct_collection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionContent {
    /// Collection id.
    pub id: CollectionId,
    /// Filenames whose chunks went into `content`, sorted.
    pub filenames: Vec<String>,
    /// Chunks joined.
    pub chunk_count: usize,
    /// Every chunk payload, in `(filename, index)` order.
    pub content: Vec<u8>,
}

impl CollectionContent {
    /// Content as UTF-8, if it is valid.
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Result of [`ReassemblyEngine::delete_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReport {
    /// Filename whose collections were deleted.
    pub filename: String,
    /// Collections a deletion was attempted on.
    pub attempted: usize,
    /// Collections deleted.
    pub deleted: Vec<CollectionId>,
    /// Collections that could not be deleted, with the error.
    pub failed: Vec<(CollectionId, String)>,
}

impl DeleteReport {
    /// `"deleted/attempted"` summary.
    pub fn summary(&self) -> String {
        format!("{}/{}", self.deleted.len(), self.attempted)
    }
}

fn preview(content: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(content);
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    (head, chars.next().is_some())
}

/// Engine facade.
pub struct ReassemblyEngine<S: CollectionStore + 'static> {
    store: Arc<S>,
    index: Arc<MappingIndex>,
    processor: BatchProcessor<S>,
    reconstructor: FileReconstructor<S>,
    reuse: ReuseCache,
    config: EngineConfig,
    run_lock: Mutex<()>,
}

impl<S: CollectionStore + 'static> ReassemblyEngine<S> {
    /// Create an engine with an empty mapping index.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_index(store, Arc::new(MappingIndex::new()), config)
    }

    /// Create an engine over an existing (e.g. restored) mapping index.
    pub fn with_index(store: Arc<S>, index: Arc<MappingIndex>, config: EngineConfig) -> Self {
        let processor = BatchProcessor::new(Arc::clone(&store), Arc::clone(&index), config.batch.clone());
        let reconstructor = FileReconstructor::with_options(
            Arc::clone(&store),
            Arc::clone(&index),
            config.reconstruction.clone(),
        );
        Self {
            reuse: ReuseCache::new(config.reuse_cache_entries),
            store,
            index,
            processor,
            reconstructor,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Shared mapping index.
    pub fn index(&self) -> &Arc<MappingIndex> {
        &self.index
    }

    /// Enumerate and process every collection with `concurrency` workers.
    pub async fn run_batch(&self, concurrency: usize) -> Result<BatchReport, BatchError> {
        self.run_batch_with_cancel(concurrency, &CancelSignal::new()).await
    }

    /// Like [`run_batch`](Self::run_batch), stopping early when `cancel` fires.
    ///
    /// Only one run may be active per engine; a second call fails with
    /// [`BatchError::AlreadyRunning`].
    pub async fn run_batch_with_cancel(
        &self,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<BatchReport, BatchError> {
        let _guard = self.run_lock.try_lock().map_err(|_| BatchError::AlreadyRunning)?;
        let enumerator = CollectionEnumerator::new(Arc::clone(&self.store), self.config.enumerator.clone());
        let report = self.processor.run(enumerator, concurrency, cancel).await?;
        if !report.cancelled {
            self.index.mark_refreshed(report.finished_at);
        }
        Ok(report)
    }

    /// Rebuild the index unless it was refreshed within the mapping TTL.
    pub async fn refresh_mapping(&self, force: bool) -> Result<RefreshOutcome, BatchError> {
        self.refresh_mapping_with_cancel(force, &CancelSignal::new()).await
    }

    /// Like [`refresh_mapping`](Self::refresh_mapping), with a cancellable rebuild.
    pub async fn refresh_mapping_with_cancel(
        &self,
        force: bool,
        cancel: &CancelSignal,
    ) -> Result<RefreshOutcome, BatchError> {
        if !force && self.index.is_fresh(self.config.mapping_ttl, Utc::now()) {
            debug!("mapping index still fresh, refresh skipped");
            return Ok(RefreshOutcome::Cached {
                stats: self.index.stats(),
            });
        }
        let report = self
            .run_batch_with_cancel(self.config.batch.concurrency, cancel)
            .await?;
        Ok(RefreshOutcome::Refreshed { report })
    }

    /// Reassemble `filename` from the collections mapped to it.
    pub async fn reconstruct_file(&self, filename: &str) -> Result<ReconstructedFile, ReconstructionError> {
        self.reconstructor.reconstruct(filename).await
    }

    /// Like [`reconstruct_file`](Self::reconstruct_file), reusing a cached result while
    /// the mapping index is unchanged.
    pub async fn reconstruct_file_reusing(
        &self,
        filename: &str,
    ) -> Result<ReconstructedFile, ReconstructionError> {
        let generation = self.index.generation();
        if let Some(file) = self.reuse.get(filename, generation) {
            debug!(filename, generation, "reconstruction reused");
            return Ok(file);
        }
        let file = self.reconstructor.reconstruct(filename).await?;
        self.reuse.put(generation, &file);
        Ok(file)
    }

    /// Collections holding chunks of `filename`.
    pub fn lookup_mapping(&self, filename: &str) -> BTreeSet<CollectionId> {
        self.index.lookup(filename)
    }

    /// Known filenames, sorted.
    pub fn list_filenames(&self) -> Vec<String> {
        self.index.filenames()
    }

    /// Index summary.
    pub fn mapping_stats(&self) -> MappingStats {
        self.index.stats()
    }

    /// Progress of the current or last batch run.
    pub fn progress(&self) -> BatchProgress {
        self.processor.progress()
    }

    /// Reuse cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.reuse.stats()
    }

    /// Every collection in the store.
    pub async fn list_collections(&self) -> Result<Vec<CollectionDescriptor>, EnumerationError> {
        CollectionEnumerator::new(Arc::clone(&self.store), self.config.enumerator.clone())
            .collect_all()
            .await
    }

    /// Name, counts, file info and chunk previews of one collection.
    pub async fn describe_collection(&self, id: &CollectionId) -> Result<CollectionSummary, EngineError> {
        let handle = self.store.get_collection(id).await?;
        let mut chunks = self.store.query_chunks(id, &ChunkFilter::everything()).await?;
        chunks.sort_by(|a, b| (&a.filename, a.chunk_index).cmp(&(&b.filename, b.chunk_index)));

        let file = chunks
            .iter()
            .find(|c| c.file_id.is_some())
            .or_else(|| chunks.first())
            .map(|c| FileInfo {
                filename: c.filename.clone(),
                file_id: c.file_id.clone(),
                content_hash: c.content_hash.clone(),
                source: c.source.clone(),
                total_chunks: c.total_chunks,
                embedding_config: c.embedding_config.clone(),
            });
        let filenames = chunks.iter().map(|c| c.filename.clone()).collect();
        let segments = chunks
            .iter()
            .map(|c| {
                let (preview, truncated) = preview(&c.content);
                SegmentPreview {
                    filename: c.filename.clone(),
                    chunk_index: c.chunk_index,
                    length: c.content.len(),
                    preview,
                    truncated,
                }
            })
            .collect();

        Ok(CollectionSummary {
            id: handle.id,
            name: handle.name,
            item_count: handle.item_count,
            metadata: handle.metadata,
            dimension: handle.dimension,
            file,
            filenames,
            segments,
        })
    }

    /// Join every chunk of one collection, whatever file it belongs to.
    ///
    /// Chunks are ordered by `(filename, chunk_index)` and joined with the configured
    /// separator. No completeness check is made; use
    /// [`reconstruct_file`](Self::reconstruct_file) for that.
    pub async fn reconstruct_collection(&self, id: &CollectionId) -> Result<CollectionContent, EngineError> {
        let mut chunks = self.store.query_chunks(id, &ChunkFilter::everything()).await?;
        if chunks.is_empty() {
            return Err(EngineError::EmptyCollection(id.clone()));
        }
        chunks.sort_by(|a, b| (&a.filename, a.chunk_index).cmp(&(&b.filename, b.chunk_index)));

        let separator = &self.config.reconstruction.separator;
        let mut content = Vec::new();
        for (position, chunk) in chunks.iter().enumerate() {
            if position > 0 {
                content.extend_from_slice(separator);
            }
            content.extend_from_slice(&chunk.content);
        }
        let filenames: BTreeSet<String> = chunks.iter().map(|c| c.filename.clone()).collect();
        debug!(collection = %id, chunks = chunks.len(), bytes = content.len(), "collection content joined");

        Ok(CollectionContent {
            id: id.clone(),
            filenames: filenames.into_iter().collect(),
            chunk_count: chunks.len(),
            content,
        })
    }

    /// Delete every collection mapped to `filename`.
    ///
    /// Deleted collections leave the index; the filename itself is dropped once at
    /// least one deletion succeeded.
    pub async fn delete_file(&self, filename: &str) -> Result<DeleteReport, EngineError> {
        let targets = self.index.lookup(filename);
        if targets.is_empty() {
            return Err(EngineError::UnknownFilename(filename.to_string()));
        }

        let mut report = DeleteReport {
            filename: filename.to_string(),
            attempted: targets.len(),
            deleted: Vec::new(),
            failed: Vec::new(),
        };
        for id in targets {
            match self.store.delete_collection(&id).await {
                Ok(()) => {
                    self.index.remove_collection(&id);
                    report.deleted.push(id);
                }
                Err(e) => {
                    warn!(filename, collection = %id, error = %e, "collection delete failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.deleted.is_empty() {
            self.index.remove_filename(filename);
            self.reuse.invalidate(filename);
        }
        info!(filename, summary = %report.summary(), "file deleted");
        Ok(report)
    }
}
