//! File reconstruction from the chunks of one or more collections.
//!
//! ## Algorithm
//!
//! 1. Look up the collections mapped to the filename (`UnknownFilename` if none)
//! 2. Fetch the file's chunks from each collection, with content
//! 3. Validate each `(filename, collection)` group: consistent `total_chunks`,
//!    no duplicate or out-of-range index, then collect every missing index
//! 4. Concatenate complete groups in index order and check the recorded content hash
//! 5. Merge complete groups with identical content; more than one distinct content is
//!    surfaced as an [`Ambiguity`], never resolved
//! 6. Without a complete group, report the group with the fewest missing indices
//!
//! Each call is independent and persists nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content_hash::{compute_content_hash, validate_content_hash, HashValidation};
use crate::mapping::MappingIndex;
use crate::store::{CollectionStore, StoreError};
use crate::types::{
    Ambiguity, CandidateContent, Chunk, ChunkFilter, CollectionId, GroupDiagnostic,
    GroupRejection, ReconstructedFile,
};

/// Error type for reconstruction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconstructionError {
    /// No collection is mapped to the filename.
    #[error("Unknown filename: {filename}")]
    UnknownFilename {
        /// Requested filename.
        filename: String,
    },
    /// The mapped collections returned no chunks for the file.
    #[error("No chunks found for {filename} in {} mapped collections", .collections.len())]
    NoChunksFound {
        /// Requested filename.
        filename: String,
        /// Collections that were queried.
        collections: Vec<CollectionId>,
    },
    /// A chunk index occurs more than once in a group.
    #[error("Duplicate chunk {index} of {filename} in collection {collection_id}")]
    DuplicateChunk {
        /// Requested filename.
        filename: String,
        /// Collection of the group.
        collection_id: CollectionId,
        /// Duplicated index.
        index: u32,
    },
    /// Chunks of a group disagree on `total_chunks`.
    #[error("Chunks of {filename} in collection {collection_id} disagree on total_chunks: {values:?}")]
    StructuralMismatch {
        /// Requested filename.
        filename: String,
        /// Collection of the group.
        collection_id: CollectionId,
        /// Distinct totals seen.
        values: Vec<u32>,
    },
    /// A chunk index is not below the declared total.
    #[error("Chunk {index} of {filename} in collection {collection_id} exceeds total {total}")]
    IndexOutOfRange {
        /// Requested filename.
        filename: String,
        /// Collection of the group.
        collection_id: CollectionId,
        /// Offending index.
        index: u32,
        /// Declared total.
        total: u32,
    },
    /// The reassembled content does not match the recorded hash.
    #[error("Hash mismatch for {filename} in collection {collection_id}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Requested filename.
        filename: String,
        /// Collection of the group.
        collection_id: CollectionId,
        /// Recorded hash.
        expected: String,
        /// Hash of the reassembled content.
        actual: String,
    },
    /// No group is complete.
    #[error("Reconstruction of {filename} incomplete: missing chunks {missing_indices:?} of {total_chunks}")]
    Incomplete {
        /// Requested filename.
        filename: String,
        /// Best (fewest-missing) group.
        collection_id: CollectionId,
        /// Declared total of that group.
        total_chunks: u32,
        /// Missing indices of that group.
        missing_indices: Vec<u32>,
    },
    /// Fetching from a mapped collection failed.
    #[error("Fetching {filename} failed: {source}")]
    Store {
        /// Requested filename.
        filename: String,
        /// Adapter error.
        source: StoreError,
    },
}

impl ReconstructionError {
    fn from_rejection(filename: &str, collection_id: &CollectionId, reason: &GroupRejection) -> Self {
        let filename = filename.to_string();
        let collection_id = collection_id.clone();
        match reason.clone() {
            GroupRejection::DuplicateChunk { index } => Self::DuplicateChunk {
                filename,
                collection_id,
                index,
            },
            GroupRejection::StructuralMismatch { values } => Self::StructuralMismatch {
                filename,
                collection_id,
                values,
            },
            GroupRejection::IndexOutOfRange { index, total } => Self::IndexOutOfRange {
                filename,
                collection_id,
                index,
                total,
            },
            GroupRejection::HashMismatch { expected, actual } => Self::HashMismatch {
                filename,
                collection_id,
                expected,
                actual,
            },
        }
    }
}

impl ReconstructedFile {
    /// Turn an incomplete result into [`ReconstructionError::Incomplete`].
    pub fn into_complete(self) -> Result<Self, ReconstructionError> {
        if self.complete {
            return Ok(self);
        }
        let total_chunks = self
            .diagnostics
            .iter()
            .find_map(|d| match d {
                GroupDiagnostic::Incomplete {
                    collection_id,
                    total_chunks,
                    ..
                } if self.source_collections.contains(collection_id) => Some(*total_chunks),
                _ => None,
            })
            .unwrap_or_default();
        Err(ReconstructionError::Incomplete {
            collection_id: self.source_collections.iter().next().cloned().unwrap_or_default(),
            filename: self.filename,
            total_chunks,
            missing_indices: self.missing_indices,
        })
    }
}

/// Options applied when assembling content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionOptions {
    /// Inserted between consecutive chunks. Empty means exact concatenation.
    pub separator: Vec<u8>,
}

impl ReconstructionOptions {
    /// Join chunks with `separator`.
    pub fn joined(separator: impl Into<Vec<u8>>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

/// Outcome of validating one `(filename, collection)` chunk group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Every index is present; payloads in index order.
    Complete(Vec<Vec<u8>>),
    /// Structurally sound, some indices absent.
    Incomplete {
        /// Declared total.
        total_chunks: u32,
        /// Absent indices, ascending.
        missing_indices: Vec<u32>,
    },
    /// The group cannot be reassembled.
    Rejected(GroupRejection),
}

/// Validate one group of chunks sharing filename and collection.
///
/// Hashes are checked against the exact concatenation, before any separator.
pub fn validate_group(mut chunks: Vec<Chunk>) -> GroupVerdict {
    let totals: BTreeSet<u32> = chunks.iter().map(|c| c.total_chunks).collect();
    if totals.len() != 1 || totals.contains(&0) {
        return GroupVerdict::Rejected(GroupRejection::StructuralMismatch {
            values: totals.into_iter().collect(),
        });
    }
    let total = chunks[0].total_chunks;

    chunks.sort_by_key(|c| c.chunk_index);
    for pair in chunks.windows(2) {
        if pair[0].chunk_index == pair[1].chunk_index {
            return GroupVerdict::Rejected(GroupRejection::DuplicateChunk {
                index: pair[0].chunk_index,
            });
        }
    }
    if let Some(last) = chunks.last() {
        if last.chunk_index >= total {
            return GroupVerdict::Rejected(GroupRejection::IndexOutOfRange {
                index: last.chunk_index,
                total,
            });
        }
    }

    if chunks.len() < total as usize {
        let present: BTreeSet<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let missing_indices = (0..total).filter(|i| !present.contains(i)).collect();
        return GroupVerdict::Incomplete {
            total_chunks: total,
            missing_indices,
        };
    }

    let recorded: BTreeSet<String> = chunks.iter().filter_map(|c| c.content_hash.clone()).collect();
    let parts: Vec<Vec<u8>> = chunks.into_iter().map(|c| c.content).collect();
    if !recorded.is_empty() {
        if let HashValidation::Mismatch { expected, actual } =
            validate_content_hash(&parts.concat(), recorded.iter().map(String::as_str))
        {
            return GroupVerdict::Rejected(GroupRejection::HashMismatch { expected, actual });
        }
    }
    GroupVerdict::Complete(parts)
}

/// Reassembles files from the collections the mapping index points at.
pub struct FileReconstructor<S: CollectionStore + ?Sized> {
    store: Arc<S>,
    index: Arc<MappingIndex>,
    options: ReconstructionOptions,
}

impl<S: CollectionStore + ?Sized> FileReconstructor<S> {
    /// Create a reconstructor with exact concatenation.
    pub fn new(store: Arc<S>, index: Arc<MappingIndex>) -> Self {
        Self::with_options(store, index, ReconstructionOptions::default())
    }

    /// Create a reconstructor with explicit options.
    pub fn with_options(store: Arc<S>, index: Arc<MappingIndex>, options: ReconstructionOptions) -> Self {
        Self { store, index, options }
    }

    /// Options in use.
    pub fn options(&self) -> &ReconstructionOptions {
        &self.options
    }

    /// Reassemble `filename`.
    ///
    /// An incomplete file is `Ok` with `complete == false`; use
    /// [`ReconstructedFile::into_complete`] to treat it as an error.
    pub async fn reconstruct(&self, filename: &str) -> Result<ReconstructedFile, ReconstructionError> {
        let candidates = self.index.lookup(filename);
        if candidates.is_empty() {
            return Err(ReconstructionError::UnknownFilename {
                filename: filename.to_string(),
            });
        }
        debug!(filename, candidates = candidates.len(), "reconstruction started");

        let filter = ChunkFilter::for_file(filename);
        let mut diagnostics = Vec::new();
        let mut complete: Vec<(CollectionId, Vec<Vec<u8>>)> = Vec::new();
        let mut incomplete: Vec<(CollectionId, u32, Vec<u32>)> = Vec::new();
        let mut rejected: Vec<(CollectionId, GroupRejection)> = Vec::new();

        for collection_id in &candidates {
            let chunks = match self.store.query_chunks(collection_id, &filter).await {
                Ok(chunks) => chunks,
                Err(StoreError::NotFound(_)) => {
                    warn!(filename, collection = %collection_id, "mapped collection vanished");
                    diagnostics.push(GroupDiagnostic::Vanished {
                        collection_id: collection_id.clone(),
                    });
                    continue;
                }
                Err(source) => {
                    return Err(ReconstructionError::Store {
                        filename: filename.to_string(),
                        source,
                    })
                }
            };
            let group: Vec<Chunk> = chunks.into_iter().filter(|c| c.filename == filename).collect();
            if group.is_empty() {
                continue;
            }

            match validate_group(group) {
                GroupVerdict::Complete(parts) => complete.push((collection_id.clone(), parts)),
                GroupVerdict::Incomplete {
                    total_chunks,
                    missing_indices,
                } => {
                    diagnostics.push(GroupDiagnostic::Incomplete {
                        collection_id: collection_id.clone(),
                        total_chunks,
                        missing_indices: missing_indices.clone(),
                    });
                    incomplete.push((collection_id.clone(), total_chunks, missing_indices));
                }
                GroupVerdict::Rejected(reason) => {
                    warn!(filename, collection = %collection_id, ?reason, "chunk group rejected");
                    diagnostics.push(GroupDiagnostic::Rejected {
                        collection_id: collection_id.clone(),
                        reason: reason.clone(),
                    });
                    rejected.push((collection_id.clone(), reason));
                }
            }
        }

        if !complete.is_empty() {
            return Ok(self.assemble(filename, complete, diagnostics));
        }

        // Fewest missing wins; candidates are visited in id order so ties keep the lowest id.
        if let Some((collection_id, _, missing_indices)) = incomplete
            .into_iter()
            .reduce(|best, next| if next.2.len() < best.2.len() { next } else { best })
        {
            info!(
                filename,
                collection = %collection_id,
                missing = missing_indices.len(),
                "reconstruction incomplete"
            );
            return Ok(ReconstructedFile {
                filename: filename.to_string(),
                content: Vec::new(),
                source_collections: BTreeSet::from([collection_id]),
                complete: false,
                missing_indices,
                ambiguity: None,
                diagnostics,
            });
        }

        if let Some((collection_id, reason)) = rejected.first() {
            return Err(ReconstructionError::from_rejection(filename, collection_id, reason));
        }

        Err(ReconstructionError::NoChunksFound {
            filename: filename.to_string(),
            collections: candidates.into_iter().collect(),
        })
    }

    fn assemble(
        &self,
        filename: &str,
        complete: Vec<(CollectionId, Vec<Vec<u8>>)>,
        diagnostics: Vec<GroupDiagnostic>,
    ) -> ReconstructedFile {
        let mut candidates: Vec<CandidateContent> = Vec::new();
        for (collection_id, parts) in complete {
            let content = parts.join(self.options.separator.as_slice());
            let digest = compute_content_hash(&content);
            match candidates.iter_mut().find(|c| c.digest == digest) {
                Some(existing) => {
                    existing.collection_ids.insert(collection_id);
                }
                None => candidates.push(CandidateContent {
                    collection_ids: BTreeSet::from([collection_id]),
                    digest,
                    content,
                }),
            }
        }

        let source_collections: BTreeSet<CollectionId> = candidates
            .iter()
            .flat_map(|c| c.collection_ids.iter().cloned())
            .collect();
        let content = candidates.first().map(|c| c.content.clone()).unwrap_or_default();
        let ambiguity = if candidates.len() > 1 {
            warn!(
                filename,
                candidates = candidates.len(),
                collections = source_collections.len(),
                "complete reconstructions disagree"
            );
            Some(Ambiguity { candidates })
        } else {
            None
        };

        info!(
            filename,
            bytes = content.len(),
            collections = source_collections.len(),
            ambiguous = ambiguity.is_some(),
            "file reconstructed"
        );
        ReconstructedFile {
            filename: filename.to_string(),
            content,
            source_collections,
            complete: true,
            missing_indices: Vec::new(),
            ambiguity,
            diagnostics,
        }
    }
}
