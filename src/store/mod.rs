//! Vector store adapter interface.
//!
//! The core never talks to a concrete database. Everything it needs goes through
//! [`CollectionStore`], so a real client, a snapshot-backed store, or a test double
//! can be swapped in without touching the batch processor or the reconstructor.

pub mod memory;

use async_trait::async_trait;

use crate::types::{
    Chunk, ChunkFilter, CollectionHandle, CollectionId, CollectionPage, ErrorKind, MetadataError,
};

/// Errors reported by store adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unreachable: {0}")]
    Unreachable(String),
    /// The collection does not exist.
    #[error("Collection not found: {0}")]
    NotFound(CollectionId),
    /// A call exceeded its timeout.
    #[error("Store call on collection {collection_id} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Collection being fetched.
        collection_id: CollectionId,
        /// Timeout that elapsed.
        elapsed_ms: u64,
    },
    /// Any other backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
    /// Stored records could not be decoded into chunks.
    #[error("Invalid chunk metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
}

impl StoreError {
    /// Classification recorded on batch outcomes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) => ErrorKind::StoreUnreachable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Backend(_) => ErrorKind::Backend,
            Self::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Missing collections and undecodable metadata are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout { .. } | Self::Backend(_))
    }
}

/// Capability interface of a vector store holding chunked files.
///
/// Implementations must be safe for concurrent use; the batch processor calls
/// `query_chunks` from several workers at once. Stores that are not should be driven
/// with a concurrency of 1.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// List one page of collections, starting at `page_token` (first page when `None`).
    async fn list_collections(
        &self,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<CollectionPage, StoreError>;

    /// Fetch a collection handle.
    async fn get_collection(&self, id: &CollectionId) -> Result<CollectionHandle, StoreError>;

    /// Fetch the chunks of a collection that pass `filter`.
    async fn query_chunks(
        &self,
        id: &CollectionId,
        filter: &ChunkFilter,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Delete a collection and everything in it.
    async fn delete_collection(&self, id: &CollectionId) -> Result<(), StoreError>;
}

pub use memory::{InMemoryCollectionStore, StoreSnapshot, SnapshotCollection, SnapshotError};
