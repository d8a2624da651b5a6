//! In-memory collection store.
//!
//! Backs tests and the snapshot-driven service. Collections are kept in a `BTreeMap`
//! so listings are deterministic. Fault injection lets tests make individual
//! collections fail permanently or for a number of calls.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use super::{CollectionStore, StoreError};
use crate::types::{
    decode_records, Chunk, ChunkFilter, CollectionDescriptor, CollectionHandle, CollectionId,
    CollectionPage, RawRecord,
};

/// Serialized store contents, as loaded by the service binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Collections in the snapshot.
    pub collections: Vec<SnapshotCollection>,
}

/// One collection of a [`StoreSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCollection {
    /// Collection id.
    pub id: CollectionId,
    /// Collection name.
    pub name: String,
    /// Collection-level metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Stored records.
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

/// Errors loading a snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The file could not be read.
    #[error("Failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a valid snapshot.
    #[error("Failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
struct StoredCollection {
    name: String,
    metadata: BTreeMap<String, serde_json::Value>,
    records: Vec<RawRecord>,
}

/// Injected failure for one collection's `query_chunks` calls.
#[derive(Debug, Clone)]
enum Fault {
    Permanent(StoreError),
    Transient { remaining: u32, error: StoreError },
}

/// In-memory collection store for testing and snapshots.
#[derive(Debug, Default)]
pub struct InMemoryCollectionStore {
    collections: RwLock<BTreeMap<CollectionId, StoredCollection>>,
    faults: Mutex<BTreeMap<CollectionId, Fault>>,
    query_counts: Mutex<BTreeMap<CollectionId, usize>>,
    unreachable: AtomicBool,
    latency: Option<Duration>,
}

impl InMemoryCollectionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `query_chunks` call, to exercise concurrency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Build a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut collections = store.collections.write();
            for c in snapshot.collections {
                collections.insert(
                    c.id,
                    StoredCollection {
                        name: c.name,
                        metadata: c.metadata,
                        records: c.records,
                    },
                );
            }
        }
        store
    }

    /// Load a store from a JSON snapshot file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let bytes = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Export the current contents.
    pub fn to_snapshot(&self) -> StoreSnapshot {
        let collections = self.collections.read();
        StoreSnapshot {
            collections: collections
                .iter()
                .map(|(id, c)| SnapshotCollection {
                    id: id.clone(),
                    name: c.name.clone(),
                    metadata: c.metadata.clone(),
                    records: c.records.clone(),
                })
                .collect(),
        }
    }

    /// Create an empty collection (no-op if it exists).
    pub fn add_collection(&self, id: impl Into<CollectionId>, name: impl Into<String>) {
        let name = name.into();
        self.collections
            .write()
            .entry(id.into())
            .or_insert_with(|| StoredCollection {
                name,
                ..StoredCollection::default()
            });
    }

    /// Append a raw record, creating the collection if needed.
    pub fn insert_record(&self, id: impl Into<CollectionId>, record: RawRecord) {
        let id = id.into();
        let mut collections = self.collections.write();
        let name = id.to_string();
        collections
            .entry(id)
            .or_insert_with(|| StoredCollection {
                name,
                ..StoredCollection::default()
            })
            .records
            .push(record);
    }

    /// Append a chunk into the collection named by `chunk.collection_id`.
    pub fn insert_chunk(&self, chunk: &Chunk) {
        self.insert_record(chunk.collection_id.clone(), chunk.to_record());
    }

    /// Make every `query_chunks` call on `id` fail as unreachable.
    pub fn fail_permanently(&self, id: impl Into<CollectionId>) {
        let id = id.into();
        let error = StoreError::Unreachable(format!("injected permanent fault on {id}"));
        self.faults.lock().insert(id, Fault::Permanent(error));
    }

    /// Make the next `times` `query_chunks` calls on `id` fail as a backend error.
    pub fn fail_transiently(&self, id: impl Into<CollectionId>, times: u32) {
        let id = id.into();
        let error = StoreError::Backend(format!("injected transient fault on {id}"));
        self.faults.lock().insert(id, Fault::Transient { remaining: times, error });
    }

    /// Remove any injected fault for `id`.
    pub fn clear_fault(&self, id: &CollectionId) {
        self.faults.lock().remove(id);
    }

    /// Make every call fail as unreachable (or restore service).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `query_chunks` calls made against `id`.
    pub fn query_count(&self, id: &CollectionId) -> usize {
        self.query_counts.lock().get(id).copied().unwrap_or(0)
    }

    /// Number of collections.
    pub fn num_collections(&self) -> usize {
        self.collections.read().len()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("in-memory store marked unreachable".to_string()));
        }
        Ok(())
    }

    fn take_fault(&self, id: &CollectionId) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(id) else {
            return Ok(());
        };
        match fault {
            Fault::Permanent(error) => Err(error.clone()),
            Fault::Transient { remaining, error } => {
                if *remaining == 0 {
                    faults.remove(id);
                    return Ok(());
                }
                *remaining -= 1;
                Err(error.clone())
            }
        }
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn list_collections(
        &self,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<CollectionPage, StoreError> {
        self.check_reachable()?;

        let offset = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::Backend(format!("invalid page token: {token}")))?,
        };
        let limit = limit.max(1);

        let collections = self.collections.read();
        let descriptors: Vec<CollectionDescriptor> = collections
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(id, c)| CollectionDescriptor::new(id.clone(), c.name.clone(), c.records.len() as u64))
            .collect();

        let next = offset + descriptors.len();
        let next_page_token = (next < collections.len()).then(|| next.to_string());

        Ok(CollectionPage {
            descriptors,
            next_page_token,
        })
    }

    async fn get_collection(&self, id: &CollectionId) -> Result<CollectionHandle, StoreError> {
        self.check_reachable()?;
        let collections = self.collections.read();
        let c = collections.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(CollectionHandle {
            id: id.clone(),
            name: c.name.clone(),
            item_count: c.records.len() as u64,
            metadata: c.metadata.clone(),
            dimension: c.records.iter().find_map(|r| r.embedding.as_ref().map(Vec::len)),
        })
    }

    async fn query_chunks(
        &self,
        id: &CollectionId,
        filter: &ChunkFilter,
    ) -> Result<Vec<Chunk>, StoreError> {
        self.check_reachable()?;
        *self.query_counts.lock().entry(id.clone()).or_insert(0) += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.take_fault(id)?;

        let records: Vec<RawRecord> = {
            let collections = self.collections.read();
            let c = collections.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            c.records.iter().filter(|r| filter.matches(r)).cloned().collect()
        };

        let decoded = decode_records(id, &records);
        for rejected in &decoded.rejected {
            warn!(collection = %id, error = %rejected, "record left out of decoding");
        }
        // Nothing salvageable: surface the metadata problem instead of an empty result.
        if decoded.chunks.is_empty() {
            if let Some(first) = decoded.rejected.into_iter().next() {
                return Err(StoreError::InvalidMetadata(first));
            }
        }

        let mut chunks = decoded.chunks;
        if !filter.include_content {
            for chunk in &mut chunks {
                chunk.content.clear();
            }
        }
        Ok(chunks)
    }

    async fn delete_collection(&self, id: &CollectionId) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.collections
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> InMemoryCollectionStore {
        let store = InMemoryCollectionStore::new();
        for i in 0..n {
            store.insert_chunk(&Chunk::new(format!("c{i:02}"), format!("f{i}.txt"), 0, 1, b"x".to_vec()));
        }
        store
    }

    #[tokio::test]
    async fn test_pagination_covers_all_collections() {
        let store = store_with(5);

        let first = store.list_collections(None, 2).await.unwrap();
        assert_eq!(first.descriptors.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));

        let last = store.list_collections(Some("4"), 2).await.unwrap();
        assert_eq!(last.descriptors.len(), 1);
        assert!(last.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_metadata_only_query_strips_content() {
        let store = store_with(1);
        let id = CollectionId::new("c00");

        let meta = store.query_chunks(&id, &ChunkFilter::metadata_only()).await.unwrap();
        assert!(meta[0].content.is_empty());
        assert_eq!(meta[0].filename, "f0.txt");

        let full = store.query_chunks(&id, &ChunkFilter::everything()).await.unwrap();
        assert_eq!(full[0].content, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let store = store_with(1);
        let id = CollectionId::new("c00");
        store.fail_transiently(id.clone(), 2);

        assert!(store.query_chunks(&id, &ChunkFilter::metadata_only()).await.is_err());
        assert!(store.query_chunks(&id, &ChunkFilter::metadata_only()).await.is_err());
        assert!(store.query_chunks(&id, &ChunkFilter::metadata_only()).await.is_ok());
        assert_eq!(store.query_count(&id), 3);
    }

    #[tokio::test]
    async fn test_missing_collection_is_not_found() {
        let store = store_with(0);
        let err = store
            .query_chunks(&CollectionId::new("nope"), &ChunkFilter::everything())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(matches!(
            store.delete_collection(&CollectionId::new("nope")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = store_with(1);
        store.set_unreachable(true);
        assert!(matches!(store.list_collections(None, 10).await, Err(StoreError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_malformed_record_only_drops_itself() {
        let store = store_with(0);
        store.insert_chunk(&Chunk::new("C1", "good.txt", 0, 1, b"fine".to_vec()));
        store.insert_record("C1", RawRecord::text("stray", "??", serde_json::Map::new()));

        let chunks = store
            .query_chunks(&CollectionId::new("C1"), &ChunkFilter::everything())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].filename, "good.txt");

        store.insert_record("C2", RawRecord::text("stray", "??", serde_json::Map::new()));
        assert!(matches!(
            store.query_chunks(&CollectionId::new("C2"), &ChunkFilter::everything()).await,
            Err(StoreError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = store_with(3);
        let json = serde_json::to_string(&store.to_snapshot()).unwrap();
        let restored = InMemoryCollectionStore::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.num_collections(), 3);
    }
}
