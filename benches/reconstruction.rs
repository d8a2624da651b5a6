//! Performance benchmarks for reconstruction and batch processing.
//!
//! Run with: `cargo bench --bench reconstruction`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Group validation | Linear in chunk count | Sort + gap scan + hash |
//! | Reconstruction | <5ms p99 for 1k chunks | In-memory store |
//! | Reused reconstruction | <100µs | LRU cache hit |
//! | Batch run | Scales with workers | Store latency bound |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use collection_reassembler::{
    compute_content_hash, validate_group, Chunk, EngineConfig, GroupVerdict,
    InMemoryCollectionStore, ReassemblyEngine,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Chunks of one file, in reverse order, with the whole-file hash recorded.
fn make_chunks(collection: &str, filename: &str, count: u32) -> Vec<Chunk> {
    let parts: Vec<String> = (0..count).map(|i| format!("segment {i:06} of the file\n")).collect();
    let hash = compute_content_hash(parts.concat().as_bytes());
    (0..count)
        .rev()
        .map(|i| {
            Chunk::new(collection, filename, i, count, parts[i as usize].clone().into_bytes())
                .with_content_hash(hash.clone())
        })
        .collect()
}

/// Benchmark pure group validation.
fn bench_validate_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_group");

    for count in [10u32, 100, 1_000, 10_000] {
        let chunks = make_chunks("C1", "f.txt", count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("chunks", count), &chunks, |b, chunks| {
            b.iter(|| {
                let verdict = validate_group(black_box(chunks.clone()));
                assert!(matches!(verdict, GroupVerdict::Complete(_)));
                verdict
            })
        });
    }

    group.finish();
}

/// Benchmark end-to-end reconstruction, cold and reused.
fn bench_reconstruct(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reconstruct");

    for count in [10u32, 100, 1_000] {
        let store = InMemoryCollectionStore::new();
        for chunk in make_chunks("C1", "f.txt", count) {
            store.insert_chunk(&chunk);
        }
        let engine = ReassemblyEngine::new(Arc::new(store), EngineConfig::default());
        rt.block_on(engine.run_batch(1)).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("cold", count), |b| {
            b.iter(|| {
                let file = rt.block_on(engine.reconstruct_file(black_box("f.txt"))).unwrap();
                assert!(file.complete);
                file
            })
        });
        group.bench_function(BenchmarkId::new("reused", count), |b| {
            b.iter(|| {
                let file = rt
                    .block_on(engine.reconstruct_file_reusing(black_box("f.txt")))
                    .unwrap();
                assert!(file.complete);
                file
            })
        });
    }

    group.finish();
}

/// Benchmark batch runs against a store with per-call latency.
fn bench_batch_workers(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_workers");
    group.sample_size(10);

    let store = InMemoryCollectionStore::new().with_latency(Duration::from_millis(1));
    for i in 0..100 {
        for chunk in make_chunks(&format!("c{i:03}"), &format!("f{i:03}.txt"), 4) {
            store.insert_chunk(&chunk);
        }
    }
    let store = Arc::new(store);

    for workers in [1usize, 4, 16] {
        let engine = ReassemblyEngine::new(Arc::clone(&store), EngineConfig::default());

        group.throughput(Throughput::Elements(100));
        group.bench_function(BenchmarkId::new("workers", workers), |b| {
            b.iter(|| {
                let report = rt.block_on(engine.run_batch(workers)).unwrap();
                assert_eq!(report.completed, 100);
                report
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_validate_group, bench_reconstruct, bench_batch_workers);
criterion_main!(benches);
