//! Filename → collection mapping index.
//!
//! The index is the only mutable state shared between batch workers and readers. It
//! sits behind one `parking_lot::RwLock`: every mutation is a single write critical
//! section (read-modify-write of both directions of the mapping), readers proceed
//! concurrently.
//!
//! The mapping is multi-valued. A filename found in several collections keeps every
//! collection id; choosing between them is left to the reconstructor's caller.
//!
//! A reverse map (collection → filenames) lets a batch run replace exactly the entries
//! of the collections it re-processed while leaving all other entries untouched.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::types::{Chunk, CollectionId};

/// Summary of the index contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStats {
    /// Distinct filenames.
    pub files: usize,
    /// Total `(filename, collection)` pairs.
    pub mappings: usize,
    /// Collections contributing at least one filename.
    pub collections: usize,
    /// Bumped on every change to the contents.
    pub generation: u64,
    /// Last completed refresh, if any.
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MappingState {
    by_filename: BTreeMap<String, BTreeSet<CollectionId>>,
    by_collection: BTreeMap<CollectionId, BTreeSet<String>>,
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
}

impl MappingState {
    fn link(&mut self, filename: &str, collection_id: &CollectionId) -> bool {
        let added = self
            .by_filename
            .entry(filename.to_string())
            .or_default()
            .insert(collection_id.clone());
        if added {
            self.by_collection
                .entry(collection_id.clone())
                .or_default()
                .insert(filename.to_string());
        }
        added
    }

    fn unlink_collection(&mut self, collection_id: &CollectionId) -> usize {
        let Some(filenames) = self.by_collection.remove(collection_id) else {
            return 0;
        };
        for filename in &filenames {
            if let Some(collections) = self.by_filename.get_mut(filename) {
                collections.remove(collection_id);
                if collections.is_empty() {
                    self.by_filename.remove(filename);
                }
            }
        }
        filenames.len()
    }
}

/// Concurrent filename → collections index.
#[derive(Debug, Default)]
pub struct MappingIndex {
    state: RwLock<MappingState>,
}

impl MappingIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the `(filename, collection)` pairs carried by `chunks`.
    ///
    /// Idempotent: re-applying the same chunks changes nothing. Returns the number of
    /// new pairs.
    pub fn update(&self, chunks: &[Chunk]) -> usize {
        let mut state = self.state.write();
        let added = chunks
            .iter()
            .filter(|c| state.link(&c.filename, &c.collection_id))
            .count();
        if added > 0 {
            state.generation += 1;
        }
        added
    }

    /// Replace every entry of `collection_id` with the filenames carried by `chunks`.
    ///
    /// Chunks are attributed to `collection_id` regardless of their own collection field.
    pub fn replace_collection(&self, collection_id: &CollectionId, chunks: &[Chunk]) {
        let filenames: BTreeSet<&str> = chunks.iter().map(|c| c.filename.as_str()).collect();

        let mut state = self.state.write();
        let unchanged = state
            .by_collection
            .get(collection_id)
            .map(|current| current.iter().map(String::as_str).eq(filenames.iter().copied()))
            .unwrap_or(filenames.is_empty());
        if unchanged {
            return;
        }

        state.unlink_collection(collection_id);
        for filename in filenames {
            state.link(filename, collection_id);
        }
        state.generation += 1;
    }

    /// Drop every entry of a collection. Returns the number of filenames unlinked.
    pub fn remove_collection(&self, collection_id: &CollectionId) -> usize {
        let mut state = self.state.write();
        let removed = state.unlink_collection(collection_id);
        if removed > 0 {
            state.generation += 1;
        }
        removed
    }

    /// Drop a filename entirely. Returns the collections it was mapped to.
    pub fn remove_filename(&self, filename: &str) -> BTreeSet<CollectionId> {
        let mut state = self.state.write();
        let Some(collections) = state.by_filename.remove(filename) else {
            return BTreeSet::new();
        };
        for collection_id in &collections {
            if let Some(filenames) = state.by_collection.get_mut(collection_id) {
                filenames.remove(filename);
                if filenames.is_empty() {
                    state.by_collection.remove(collection_id);
                }
            }
        }
        state.generation += 1;
        collections
    }

    /// Collections holding fragments of `filename` (empty if unknown).
    pub fn lookup(&self, filename: &str) -> BTreeSet<CollectionId> {
        self.state
            .read()
            .by_filename
            .get(filename)
            .cloned()
            .unwrap_or_default()
    }

    /// Filenames contributed by a collection.
    pub fn filenames_in(&self, collection_id: &CollectionId) -> BTreeSet<String> {
        self.state
            .read()
            .by_collection
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All known filenames, sorted.
    pub fn filenames(&self) -> Vec<String> {
        self.state.read().by_filename.keys().cloned().collect()
    }

    /// Copy of the whole mapping, for callers that persist it.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<CollectionId>> {
        self.state.read().by_filename.clone()
    }

    /// Current generation; changes whenever the contents change.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Record a completed refresh.
    pub fn mark_refreshed(&self, at: DateTime<Utc>) {
        self.state.write().refreshed_at = Some(at);
    }

    /// Whether the last refresh happened less than `ttl` before `now`.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Some(refreshed_at) = self.state.read().refreshed_at else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - refreshed_at < ttl,
            Err(_) => true,
        }
    }

    /// Summary of the contents.
    pub fn stats(&self) -> MappingStats {
        let state = self.state.read();
        MappingStats {
            files: state.by_filename.len(),
            mappings: state.by_filename.values().map(BTreeSet::len).sum(),
            collections: state.by_collection.len(),
            generation: state.generation,
            refreshed_at: state.refreshed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(collection: &str, filename: &str) -> Chunk {
        Chunk::new(collection, filename, 0, 1, Vec::new())
    }

    fn ids(values: &[&str]) -> BTreeSet<CollectionId> {
        values.iter().map(|v| CollectionId::from(*v)).collect()
    }

    #[test]
    fn test_update_is_idempotent() {
        let index = MappingIndex::new();
        let chunks = vec![chunk("C1", "a.txt"), chunk("C1", "a.txt"), chunk("C1", "b.txt")];

        assert_eq!(index.update(&chunks), 2);
        let generation = index.generation();
        assert_eq!(index.update(&chunks), 0);
        assert_eq!(index.generation(), generation);
        assert_eq!(index.lookup("a.txt"), ids(&["C1"]));
    }

    #[test]
    fn test_multi_valued_mapping() {
        let index = MappingIndex::new();
        index.update(&[chunk("C2", "notes.txt")]);
        index.update(&[chunk("C5", "notes.txt")]);

        assert_eq!(index.lookup("notes.txt"), ids(&["C2", "C5"]));
        assert!(index.lookup("unknown").is_empty());
        assert_eq!(index.stats().mappings, 2);
    }

    #[test]
    fn test_replace_collection_only_touches_that_collection() {
        let index = MappingIndex::new();
        index.update(&[chunk("C1", "old.txt"), chunk("C2", "old.txt"), chunk("C2", "keep.txt")]);

        index.replace_collection(&CollectionId::from("C1"), &[chunk("C1", "new.txt")]);

        assert_eq!(index.lookup("old.txt"), ids(&["C2"]));
        assert_eq!(index.lookup("new.txt"), ids(&["C1"]));
        assert_eq!(index.lookup("keep.txt"), ids(&["C2"]));
    }

    #[test]
    fn test_replace_with_same_filenames_keeps_generation() {
        let index = MappingIndex::new();
        let id = CollectionId::from("C1");
        index.replace_collection(&id, &[chunk("C1", "a"), chunk("C1", "b")]);
        let generation = index.generation();

        index.replace_collection(&id, &[chunk("C1", "b"), chunk("C1", "a")]);
        assert_eq!(index.generation(), generation);
    }

    #[test]
    fn test_remove_filename_cleans_reverse_map() {
        let index = MappingIndex::new();
        index.update(&[chunk("C1", "a"), chunk("C1", "b"), chunk("C2", "a")]);

        let removed = index.remove_filename("a");
        assert_eq!(removed, ids(&["C1", "C2"]));
        assert_eq!(index.filenames_in(&CollectionId::from("C1")).len(), 1);
        assert!(index.filenames_in(&CollectionId::from("C2")).is_empty());
        assert_eq!(index.stats().collections, 1);
    }

    #[test]
    fn test_freshness() {
        let index = MappingIndex::new();
        let now = Utc::now();
        assert!(!index.is_fresh(Duration::from_secs(300), now));

        index.mark_refreshed(now);
        assert!(index.is_fresh(Duration::from_secs(300), now + chrono::Duration::seconds(10)));
        assert!(!index.is_fresh(Duration::from_secs(300), now + chrono::Duration::seconds(301)));
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        let index = Arc::new(MappingIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        index.update(&[chunk(&format!("C{worker}"), &format!("f{}", i % 10))]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..10 {
            assert_eq!(index.lookup(&format!("f{i}")).len(), 8);
        }
        assert_eq!(index.stats().mappings, 80);
    }
}
