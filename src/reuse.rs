//! Opt-in reuse of reconstructed files.
//!
//! Reconstruction is stateless by default. Callers that reassemble the same files
//! repeatedly can go through a [`ReuseCache`]: entries remember the mapping
//! generation they were built against and are ignored once the index has changed.

use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ReconstructedFile;

/// Default maximum number of cached files.
pub const DEFAULT_REUSE_ENTRIES: usize = 256;

/// Hit/miss counters of a [`ReuseCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed or found a stale entry.
    pub misses: u64,
}

#[derive(Debug, Clone)]
struct CachedFile {
    generation: u64,
    file: ReconstructedFile,
}

/// LRU cache of reconstructions keyed by filename.
#[derive(Debug)]
pub struct ReuseCache {
    entries: RwLock<LruCache<String, CachedFile>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ReuseCache {
    fn default() -> Self {
        Self::new(DEFAULT_REUSE_ENTRIES)
    }
}

impl ReuseCache {
    /// Create a cache holding at most `max_entries` files (at least one).
    pub fn new(max_entries: usize) -> Self {
        let size = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached reconstruction of `filename`, if built against `generation`.
    pub fn get(&self, filename: &str, generation: u64) -> Option<ReconstructedFile> {
        let found = {
            let mut entries = self.entries.write();
            match entries.get(filename) {
                Some(cached) if cached.generation == generation => Some(cached.file.clone()),
                Some(_) => {
                    entries.pop(filename);
                    None
                }
                None => None,
            }
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a reconstruction built against `generation`.
    ///
    /// Only complete files are kept; incomplete ones should be retried after a refresh.
    pub fn put(&self, generation: u64, file: &ReconstructedFile) {
        if !file.complete {
            return;
        }
        self.entries.write().put(
            file.filename.clone(),
            CachedFile {
                generation,
                file: file.clone(),
            },
        );
    }

    /// Drop one file.
    pub fn invalidate(&self, filename: &str) {
        self.entries.write().pop(filename);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectionId;
    use std::collections::BTreeSet;

    fn file(name: &str, complete: bool) -> ReconstructedFile {
        ReconstructedFile {
            filename: name.to_string(),
            content: if complete { b"data".to_vec() } else { Vec::new() },
            source_collections: BTreeSet::from([CollectionId::new("C1")]),
            complete,
            missing_indices: if complete { vec![] } else { vec![1] },
            ambiguity: None,
            diagnostics: vec![],
        }
    }

    #[test]
    fn test_hit_on_same_generation() {
        let cache = ReuseCache::new(4);
        cache.put(3, &file("a.txt", true));

        assert_eq!(cache.get("a.txt", 3).unwrap().content, b"data");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_stale_generation_is_evicted() {
        let cache = ReuseCache::new(4);
        cache.put(3, &file("a.txt", true));

        assert!(cache.get("a.txt", 4).is_none());
        assert_eq!(cache.stats(), CacheStats { entries: 0, hits: 0, misses: 1 });
    }

    #[test]
    fn test_incomplete_files_are_not_cached() {
        let cache = ReuseCache::new(4);
        cache.put(1, &file("a.txt", false));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_bound() {
        let cache = ReuseCache::new(2);
        cache.put(1, &file("a", true));
        cache.put(1, &file("b", true));
        cache.put(1, &file("c", true));

        assert!(cache.get("a", 1).is_none());
        assert!(cache.get("c", 1).is_some());
        assert_eq!(cache.stats().entries, 2);
    }
}
