//! Result types of file reconstruction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::collection::CollectionId;

/// Why a `(filename, collection)` chunk group cannot be reassembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupRejection {
    /// The same chunk index appears more than once.
    DuplicateChunk {
        /// First duplicated index.
        index: u32,
    },
    /// Chunks disagree on `total_chunks` (or declare zero).
    StructuralMismatch {
        /// Distinct `total_chunks` values seen, ascending.
        values: Vec<u32>,
    },
    /// A chunk index lies outside `[0, total_chunks)`.
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared total.
        total: u32,
    },
    /// The reassembled content does not match the recorded hash.
    HashMismatch {
        /// Hash recorded in chunk metadata.
        expected: String,
        /// Hash of the reassembled content.
        actual: String,
    },
}

/// Diagnostic for a chunk group that did not yield complete content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GroupDiagnostic {
    /// The group is structurally sound but some indices are absent.
    Incomplete {
        /// Collection of the group.
        collection_id: CollectionId,
        /// Declared total.
        total_chunks: u32,
        /// Absent indices, ascending.
        missing_indices: Vec<u32>,
    },
    /// The group was rejected.
    Rejected {
        /// Collection of the group.
        collection_id: CollectionId,
        /// Rejection reason.
        reason: GroupRejection,
    },
    /// The collection was mapped but no longer exists in the store.
    Vanished {
        /// Collection id.
        collection_id: CollectionId,
    },
}

impl GroupDiagnostic {
    /// Collection the diagnostic refers to.
    pub fn collection_id(&self) -> &CollectionId {
        match self {
            Self::Incomplete { collection_id, .. }
            | Self::Rejected { collection_id, .. }
            | Self::Vanished { collection_id } => collection_id,
        }
    }
}

/// One distinct complete reconstruction of an ambiguous file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateContent {
    /// Collections that produced exactly this content.
    pub collection_ids: BTreeSet<CollectionId>,
    /// SHA-256 of the content, hex encoded.
    pub digest: String,
    /// Reassembled content.
    pub content: Vec<u8>,
}

/// Marker attached when several collections reassemble different complete content.
///
/// No candidate is preferred; callers pick one explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    /// Distinct candidates, ordered by their lowest collection id.
    pub candidates: Vec<CandidateContent>,
}

/// A reassembled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedFile {
    /// Filename requested.
    pub filename: String,
    /// Reassembled content. For ambiguous files, the first candidate's content.
    /// Empty when incomplete.
    pub content: Vec<u8>,
    /// Collections contributing to the result.
    pub source_collections: BTreeSet<CollectionId>,
    /// Whether at least one group was complete.
    pub complete: bool,
    /// Missing indices of the best group when incomplete, ascending.
    pub missing_indices: Vec<u32>,
    /// Present when complete groups disagree on content.
    pub ambiguity: Option<Ambiguity>,
    /// Groups that did not contribute complete content.
    pub diagnostics: Vec<GroupDiagnostic>,
}

impl ReconstructedFile {
    /// Whether complete groups disagree.
    pub fn is_ambiguous(&self) -> bool {
        self.ambiguity.is_some()
    }

    /// Content as UTF-8 text, if valid.
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Select the content produced by a specific collection of an ambiguous file.
    pub fn candidate_for(&self, collection_id: &CollectionId) -> Option<&CandidateContent> {
        self.ambiguity
            .as_ref()?
            .candidates
            .iter()
            .find(|c| c.collection_ids.contains(collection_id))
    }
}
