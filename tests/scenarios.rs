//! End-to-end scenarios for batch processing and reconstruction.
//!
//! Every scenario goes through the public API only: an in-memory store, the batch
//! processor or engine, and the reconstructor.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collection_reassembler::{
    BatchConfig, BatchProcessor, CancelSignal, Chunk, ChunkFilter, CollectionEnumerator,
    CollectionHandle, CollectionId, CollectionPage, CollectionStore, EngineConfig,
    EnumeratorConfig, ErrorKind, InMemoryCollectionStore, MappingIndex, OutcomeStatus, RawRecord,
    ReassemblyEngine, ReconstructionError, RetryPolicy, SkipReason, StoreError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn chunk(cid: &str, filename: &str, index: u32, total: u32, content: &str) -> Chunk {
    Chunk::new(cid, filename, index, total, content.as_bytes().to_vec())
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.batch = BatchConfig::default().with_retry(RetryPolicy::immediate(3));
    config.enumerator = EnumeratorConfig { page_size: 7 };
    config
}

fn engine(store: InMemoryCollectionStore) -> ReassemblyEngine<InMemoryCollectionStore> {
    ReassemblyEngine::new(Arc::new(store), test_config())
}

/// 50 collections `c00`..`c49`, each holding one 2-chunk file.
fn fifty_collections() -> InMemoryCollectionStore {
    let store = InMemoryCollectionStore::new();
    for i in 0..50 {
        let cid = format!("c{i:02}");
        let filename = format!("doc{i:02}.txt");
        store.insert_chunk(&chunk(&cid, &filename, 0, 2, "first "));
        store.insert_chunk(&chunk(&cid, &filename, 1, 2, "second"));
    }
    store
}

/// Store wrapper that cancels a signal once `query_chunks` was called `limit` times.
struct CancellingStore {
    inner: InMemoryCollectionStore,
    queries: AtomicUsize,
    limit: usize,
    signal: CancelSignal,
}

#[async_trait]
impl CollectionStore for CancellingStore {
    async fn list_collections(
        &self,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<CollectionPage, StoreError> {
        self.inner.list_collections(page_token, limit).await
    }

    async fn get_collection(&self, id: &CollectionId) -> Result<CollectionHandle, StoreError> {
        self.inner.get_collection(id).await
    }

    async fn query_chunks(
        &self,
        id: &CollectionId,
        filter: &ChunkFilter,
    ) -> Result<Vec<Chunk>, StoreError> {
        let result = self.inner.query_chunks(id, filter).await;
        if self.queries.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
            self.signal.cancel();
        }
        result
    }

    async fn delete_collection(&self, id: &CollectionId) -> Result<(), StoreError> {
        self.inner.delete_collection(id).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_round_trip_single_collection() {
    let store = InMemoryCollectionStore::new();
    store.insert_chunk(&chunk("C1", "report.pdf", 2, 3, "C"));
    store.insert_chunk(&chunk("C1", "report.pdf", 0, 3, "A"));
    store.insert_chunk(&chunk("C1", "report.pdf", 1, 3, "B"));
    let engine = engine(store);

    let report = engine.run_batch(4).await.unwrap();
    assert_eq!((report.completed, report.failed, report.skipped), (1, 0, 0));
    assert_eq!(engine.lookup_mapping("report.pdf"), BTreeSet::from([CollectionId::new("C1")]));

    let file = engine.reconstruct_file("report.pdf").await.unwrap();
    assert!(file.complete);
    assert_eq!(file.content, b"ABC");
    assert!(file.missing_indices.is_empty());
    assert_eq!(file.source_collections, BTreeSet::from([CollectionId::new("C1")]));
}

#[tokio::test]
async fn test_missing_middle_chunk_is_reported() {
    let store = InMemoryCollectionStore::new();
    store.insert_chunk(&chunk("C1", "report.pdf", 0, 3, "A"));
    store.insert_chunk(&chunk("C1", "report.pdf", 2, 3, "C"));
    let engine = engine(store);
    engine.run_batch(1).await.unwrap();

    let file = engine.reconstruct_file("report.pdf").await.unwrap();
    assert!(!file.complete);
    assert_eq!(file.missing_indices, vec![1]);
    assert!(file.content.is_empty());

    match file.into_complete() {
        Err(ReconstructionError::Incomplete { missing_indices, total_chunks, .. }) => {
            assert_eq!(missing_indices, vec![1]);
            assert_eq!(total_chunks, 3);
        }
        other => panic!("expected incomplete, got {other:?}"),
    }
}

#[tokio::test]
async fn test_one_failing_collection_is_isolated() {
    let store = fifty_collections();
    store.fail_permanently("c17");
    let engine = engine(store);

    let report = engine.run_batch(8).await.unwrap();

    assert_eq!(report.total, 50);
    assert_eq!((report.completed, report.failed, report.skipped), (49, 1, 0));
    let failed = report.outcome(&CollectionId::new("c17")).unwrap();
    assert_eq!(failed.status, OutcomeStatus::Failed);
    assert_eq!(failed.error, Some(ErrorKind::StoreUnreachable));
    assert_eq!(failed.attempts, 3);

    // Enumeration order regardless of worker scheduling.
    let order: Vec<usize> = report.outcomes.iter().map(|o| o.sequence).collect();
    assert_eq!(order, (0..50).collect::<Vec<_>>());
    assert_eq!(report.outcomes[17].collection_id, CollectionId::new("c17"));

    assert!(engine.lookup_mapping("doc17.txt").is_empty());
    assert_eq!(engine.list_filenames().len(), 49);
}

#[tokio::test]
async fn test_conflicting_copies_surface_ambiguity() {
    let store = InMemoryCollectionStore::new();
    store.insert_chunk(&chunk("C2", "notes.txt", 0, 2, "buy "));
    store.insert_chunk(&chunk("C2", "notes.txt", 1, 2, "milk"));
    store.insert_chunk(&chunk("C5", "notes.txt", 0, 2, "buy "));
    store.insert_chunk(&chunk("C5", "notes.txt", 1, 2, "eggs"));
    let engine = engine(store);
    engine.run_batch(2).await.unwrap();

    assert_eq!(
        engine.lookup_mapping("notes.txt"),
        BTreeSet::from([CollectionId::new("C2"), CollectionId::new("C5")])
    );

    let file = engine.reconstruct_file("notes.txt").await.unwrap();
    assert!(file.complete);
    assert!(file.is_ambiguous());
    assert_eq!(
        file.source_collections,
        BTreeSet::from([CollectionId::new("C2"), CollectionId::new("C5")])
    );
    assert_eq!(file.candidate_for(&CollectionId::new("C2")).unwrap().content, b"buy milk");
    assert_eq!(file.candidate_for(&CollectionId::new("C5")).unwrap().content, b"buy eggs");
}

#[tokio::test]
async fn test_cancellation_skips_unstarted_collections() {
    let signal = CancelSignal::new();
    let store = Arc::new(CancellingStore {
        inner: fifty_collections(),
        queries: AtomicUsize::new(0),
        limit: 10,
        signal: signal.clone(),
    });
    let descriptors = CollectionEnumerator::new(Arc::clone(&store), EnumeratorConfig::default())
        .collect_all()
        .await
        .unwrap();
    let index = Arc::new(MappingIndex::new());
    let processor = BatchProcessor::new(
        Arc::clone(&store),
        Arc::clone(&index),
        BatchConfig::default().with_retry(RetryPolicy::immediate(3)),
    );

    let report = processor
        .process_with_cancel(descriptors, 1, &signal)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total, 50);
    assert_eq!(report.completed, 10);
    assert_eq!(report.skipped_for(SkipReason::Cancelled).count(), 40);
    assert!(report.outcomes[..10].iter().all(|o| o.status == OutcomeStatus::Completed));
    assert!(report.outcomes[10..].iter().all(|o| o.attempts == 0));
    assert_eq!(index.stats().files, 10);
}

#[tokio::test]
async fn test_engine_cancellation_reports_every_collection() {
    let signal = CancelSignal::new();
    let inner = InMemoryCollectionStore::new();
    for i in 0..200 {
        inner.insert_chunk(&chunk(&format!("c{i:03}"), &format!("doc{i:03}.txt"), 0, 1, "x"));
    }
    let store = Arc::new(CancellingStore {
        inner,
        queries: AtomicUsize::new(0),
        limit: 10,
        signal: signal.clone(),
    });
    let engine = ReassemblyEngine::new(store, EngineConfig::default());

    let report = engine.run_batch_with_cancel(1, &signal).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total, 200);
    assert_eq!(report.completed, 10);
    assert_eq!(report.skipped_for(SkipReason::Cancelled).count(), 190);
    let order: Vec<usize> = report.outcomes.iter().map(|o| o.sequence).collect();
    assert_eq!(order, (0..200).collect::<Vec<_>>());
    assert_eq!(engine.list_filenames().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_cancels_the_rest() {
    let store = InMemoryCollectionStore::new().with_latency(Duration::from_secs(10));
    for i in 0..6 {
        store.insert_chunk(&chunk(&format!("c{i}"), &format!("doc{i}.txt"), 0, 1, "x"));
    }
    let mut config = test_config();
    config.batch = config.batch.with_batch_timeout(Duration::from_secs(25));
    let engine = ReassemblyEngine::new(Arc::new(store), config);

    let report = engine.run_batch(1).await.unwrap();

    // Fetches finish at 10s, 20s and 30s; the one in flight at 25s is not interrupted.
    assert!(report.cancelled);
    assert_eq!(report.total, 6);
    assert_eq!(report.completed, 3);
    assert_eq!(report.skipped_for(SkipReason::Cancelled).count(), 3);
}

#[tokio::test]
async fn test_split_multibyte_and_binary_content_round_trip() {
    let text = "naïve café ☕".as_bytes();
    let binary: Vec<u8> = (0..=255u8).rev().collect();

    let store = InMemoryCollectionStore::new();
    // Cut inside the two-byte "ï" and inside the three-byte "☕".
    for (index, part) in [&text[..3], &text[3..14], &text[14..]].into_iter().enumerate() {
        store.insert_chunk(&Chunk::new("C1", "menu.txt", index as u32, 3, part.to_vec()));
    }
    for (index, part) in binary.chunks(100).enumerate() {
        store.insert_chunk(&Chunk::new("C2", "blob.bin", index as u32, 3, part.to_vec()));
    }

    // Through the snapshot format as the service loads it.
    let json = serde_json::to_string(&store.to_snapshot()).unwrap();
    let store = InMemoryCollectionStore::from_snapshot(serde_json::from_str(&json).unwrap());
    let engine = engine(store);
    engine.run_batch(2).await.unwrap();

    let menu = engine.reconstruct_file("menu.txt").await.unwrap();
    assert_eq!(menu.content, text);
    let blob = engine.reconstruct_file("blob.bin").await.unwrap();
    assert_eq!(blob.content, binary);
}

#[tokio::test]
async fn test_malformed_record_does_not_fail_its_collection() {
    let store = InMemoryCollectionStore::new();
    store.insert_chunk(&chunk("C1", "good.txt", 0, 1, "kept"));
    store.insert_record("C1", RawRecord::text("stray", "no metadata", Default::default()));
    let mut mixed = chunk("C1", "mixed.txt", 0, 2, "a").to_record();
    mixed.id = "mixed-0".into();
    store.insert_record("C1", mixed);
    store.insert_record("C1", RawRecord::text("mixed-1", "b", {
        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), "mixed.txt".into());
        metadata
    }));
    let engine = engine(store);

    let report = engine.run_batch(1).await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.outcomes[0].chunk_count, 1);
    assert_eq!(engine.lookup_mapping("good.txt"), BTreeSet::from([CollectionId::new("C1")]));
    assert!(engine.lookup_mapping("mixed.txt").is_empty());
    let file = engine.reconstruct_file("good.txt").await.unwrap();
    assert_eq!(file.content_str(), Some("kept"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Cross-cutting behavior
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_report_is_identical_for_any_worker_count() {
    let store = Arc::new(fifty_collections());
    store.fail_permanently("c03");
    store.add_collection("c99", "empty");

    let mut fingerprints = BTreeSet::new();
    for workers in [1, 2, 5, 8, 32] {
        let engine = ReassemblyEngine::new(Arc::clone(&store), test_config());
        let report = engine.run_batch(workers).await.unwrap();
        assert_eq!(report.total, 51);
        fingerprints.insert(report.fingerprint());
    }
    assert_eq!(fingerprints.len(), 1);
}

#[tokio::test]
async fn test_reconstruction_is_idempotent() {
    let engine = engine(fifty_collections());
    engine.run_batch(4).await.unwrap();

    let first = engine.reconstruct_file("doc05.txt").await.unwrap();
    let second = engine.reconstruct_file("doc05.txt").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.content_str(), Some("first second"));
}

#[tokio::test]
async fn test_rerun_only_replaces_reprocessed_collections() {
    let store = Arc::new(InMemoryCollectionStore::new());
    store.insert_chunk(&chunk("C1", "a.txt", 0, 1, "a"));
    store.insert_chunk(&chunk("C2", "b.txt", 0, 1, "b"));
    let engine = ReassemblyEngine::new(Arc::clone(&store), test_config());
    engine.run_batch(2).await.unwrap();

    // C2 now fails; its previous mapping must survive the rerun.
    store.fail_permanently("C2");
    let report = engine.run_batch(2).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(engine.lookup_mapping("b.txt"), BTreeSet::from([CollectionId::new("C2")]));
}

#[tokio::test]
async fn test_hash_mismatch_is_rejected() {
    let store = InMemoryCollectionStore::new();
    store.insert_chunk(&chunk("C1", "x.bin", 0, 2, "ab").with_content_hash("sha256:0000"));
    store.insert_chunk(&chunk("C1", "x.bin", 1, 2, "cd").with_content_hash("sha256:0000"));
    let engine = engine(store);
    engine.run_batch(1).await.unwrap();

    assert!(matches!(
        engine.reconstruct_file("x.bin").await,
        Err(ReconstructionError::HashMismatch { .. })
    ));
}
