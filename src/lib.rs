//! # collection-reassembler
//!
//! Concurrent collection scanning and chunk-level file reconstruction for vector stores.
//!
//! Files ingested into a vector store are split into ordered chunks and scattered over
//! one or more collections. This crate answers two questions:
//!
//! > Which collections hold chunks of a given file?
//! > What was the original content of that file?
//!
//! ## Architecture
//!
//! ```text
//! CollectionStore ──► CollectionEnumerator ──► BatchProcessor (N workers)
//!                                                    │
//!                                                    ▼
//!                                              MappingIndex
//!                                                    │
//!                     filename ──► FileReconstructor ┴──► ReconstructedFile
//! ```
//!
//! [`ReassemblyEngine`] wires these together behind one facade.
//!
//! ## Guarantees
//!
//! - Every enumerated collection gets exactly one outcome, reported in enumeration order
//!   for any worker count
//! - A failing collection never aborts the batch
//! - Reconstruction reports every missing index, never guesses between conflicting
//!   copies, and is idempotent for an unchanged store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod cancel;
pub mod canonical;
pub mod content_hash;
pub mod engine;
pub mod enumerator;
pub mod mapping;
pub mod reconstructor;
pub mod retry;
pub mod reuse;
pub mod store;
pub mod types;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    Ambiguity, BatchReport, CandidateContent, Chunk, ChunkFilter, CollectionDescriptor,
    CollectionHandle, CollectionId, CollectionOutcome, CollectionPage, DecodedRecords, EmbeddingConfig,
    ErrorKind,
    GroupDiagnostic, GroupRejection, MetadataError, OutcomeStatus, RawRecord,
    ReconstructedFile, SkipReason,
};
pub use batch::{BatchConfig, BatchError, BatchProcessor, BatchProgress};
pub use cancel::CancelSignal;
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};
pub use content_hash::{compute_content_hash, validate_content_hash, HashValidation};
pub use engine::{
    CollectionContent, CollectionSummary, DeleteReport, EngineConfig, EngineError, FileInfo, ReassemblyEngine,
    RefreshOutcome, SegmentPreview,
};
pub use enumerator::{CollectionEnumerator, EnumerationError, EnumeratorConfig};
pub use mapping::{MappingIndex, MappingStats};
pub use reconstructor::{
    validate_group, FileReconstructor, GroupVerdict, ReconstructionError, ReconstructionOptions,
};
pub use retry::RetryPolicy;
pub use reuse::{CacheStats, ReuseCache};
pub use store::{CollectionStore, InMemoryCollectionStore, StoreError, StoreSnapshot};

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version of the serialized report and result types.
pub const REASSEMBLY_SCHEMA_VERSION: &str = "1.0.0";
