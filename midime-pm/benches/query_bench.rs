//! Query Latency Benchmark
//!
//! Measures top-k query latency for each index backend.
//!
//! ## Scenarios
//!
//! - Exact scan at 1k / 10k patterns
//! - Neighbor list lookup for a stored pattern
//! - Approximate graph at 50k patterns (graph built once, outside the timing)
//! - Cosine similarity of one 60-dim pair

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use midime_pm::config::IndexConfig;
use midime_pm::index::similarity::cosine_similarity;
use midime_pm::index::PatternIndex;
use midime_pm::models::{InstrumentType, NeighborList, Pattern, FINGERPRINT_DIMS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const K: usize = 20;

fn random_vectors(count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..FINGERPRINT_DIMS).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect()
}

fn filled_index(config: IndexConfig, count: usize) -> PatternIndex {
    let index = PatternIndex::new(config);
    for vector in random_vectors(count, 1) {
        index
            .insert(Pattern::new(InstrumentType::Drums, vector).unwrap())
            .unwrap();
    }
    index
}

fn exact_config() -> IndexConfig {
    IndexConfig {
        brute_force_limit: usize::MAX,
        precomputed_limit: usize::MAX,
        ..IndexConfig::default()
    }
}

/// Benchmark: exact scan
///
/// **Target:** <5ms at 10k patterns
fn bench_exact_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("exact_scan");
    let query = random_vectors(1, 99).remove(0);

    for size in [1_000usize, 10_000] {
        let index = filled_index(exact_config(), size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                index
                    .query(black_box(&query), InstrumentType::Drums, K, None)
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Benchmark: neighbor list lookup
///
/// **Target:** independent of shard size
fn bench_neighbor_list(c: &mut Criterion) {
    let config = IndexConfig {
        brute_force_limit: 10,
        precomputed_limit: usize::MAX,
        ..IndexConfig::default()
    };
    let index = filled_index(config, 10_000);
    let snapshot = index.snapshot(InstrumentType::Drums);
    let pattern_id = snapshot.pattern_at(0).unwrap().pattern_id;
    let list = NeighborList::new(pattern_id, InstrumentType::Drums, snapshot.exact_neighbors(0, 50), 50);
    index.publish_neighbor_lists(InstrumentType::Drums, vec![list]);

    c.bench_function("neighbor_list_lookup", |b| {
        b.iter(|| index.query_pattern(black_box(pattern_id), K, None).unwrap())
    });
}

/// Benchmark: approximate graph query
///
/// **Target:** sub-linear; well under the exact scan at the same size
fn bench_approximate(c: &mut Criterion) {
    let config = IndexConfig {
        brute_force_limit: 100,
        precomputed_limit: 1_000,
        ..IndexConfig::default()
    };
    let index = filled_index(config, 50_000);
    index.refresh_ann(InstrumentType::Drums);
    let queries = random_vectors(64, 98);

    let mut i = 0;
    c.bench_function("approximate_50k", |b| {
        b.iter(|| {
            i = (i + 1) % queries.len();
            index
                .query(black_box(&queries[i]), InstrumentType::Drums, K, None)
                .unwrap()
        })
    });
}

fn bench_cosine(c: &mut Criterion) {
    let vectors = random_vectors(2, 3);
    c.bench_function("cosine_similarity_60d", |b| {
        b.iter(|| cosine_similarity(black_box(&vectors[0]), black_box(&vectors[1])))
    });
}

criterion_group!(
    benches,
    bench_exact_scan,
    bench_neighbor_list,
    bench_approximate,
    bench_cosine
);
criterion_main!(benches);
