//! Approximate nearest-neighbor backend
//!
//! HNSW graph from `hnsw_rs` under cosine distance. Graph data ids are shard
//! positions, so a backend covers a prefix `[0, covered())` of the shard;
//! later inserts are scanned exactly until the graph is extended.

use super::brute_force::Candidate;
use super::entries::Entries;
use super::IndexError;
use crate::config::IndexConfig;
use hnsw_rs::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Layer cap accepted by `hnsw_rs`
const MAX_LAYER: usize = 16;

/// Search contract shared by approximate backends
pub trait AnnBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Number of leading shard positions the backend indexes
    fn covered(&self) -> usize;

    /// Approximate top-k by similarity, best first
    ///
    /// Returns the candidates and whether the deadline cut the search short.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Candidate>, bool), IndexError>;

    /// Backend that also covers the entries past `covered()`
    fn extended(&self, entries: &Entries) -> Arc<dyn AnnBackend>;
}

/// Graph construction and search parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnParams {
    /// Max links per node on upper layers; layer 0 allows twice this
    pub max_degree: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub recall_target: f32,
}

impl AnnParams {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            max_degree: config.ann_max_degree.max(2),
            ef_construction: config.ann_ef_construction.max(1),
            ef_search: config.ann_ef_search.max(1),
            recall_target: config.ann_recall_target,
        }
    }

    /// Beam width for a k-result search; higher recall targets widen it
    pub fn beam_width(&self, k: usize) -> usize {
        let miss_rate = (1.0 - self.recall_target).clamp(0.01, 1.0);
        let widened = (k as f32 / miss_rate / 4.0).ceil() as usize;
        self.ef_search.max(k).max(widened)
    }
}

/// HNSW graph over a shard prefix
///
/// Extensions insert into the shared graph, so an older backend may see
/// data ids past its own coverage. Those are dropped at search time.
pub struct HnswIndex {
    params: AnnParams,
    dims: usize,
    graph: Arc<Hnsw<'static, f32, DistCosine>>,
    covered: usize,
}

impl fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HnswIndex")
            .field("covered", &self.covered)
            .field("dims", &self.dims)
            .field("params", &self.params)
            .finish()
    }
}

impl HnswIndex {
    /// Build over every entry of a shard
    pub fn build(params: AnnParams, dims: usize, entries: &Entries) -> Self {
        let graph = Hnsw::<f32, DistCosine>::new(
            params.max_degree,
            entries.len().max(1),
            MAX_LAYER,
            params.ef_construction,
            DistCosine {},
        );
        let index = Self {
            params,
            dims,
            graph: Arc::new(graph),
            covered: 0,
        };
        index.insert_from(entries)
    }

    /// Insert entries past the current coverage into the shared graph
    fn insert_from(&self, entries: &Entries) -> Self {
        let batch: Vec<(&[f32], usize)> = entries
            .iter_from(self.covered)
            .map(|(position, pattern)| (pattern.fingerprint(), position))
            .collect();
        if !batch.is_empty() {
            self.graph.parallel_insert_slice(&batch);
        }
        Self {
            params: self.params,
            dims: self.dims,
            graph: Arc::clone(&self.graph),
            covered: self.covered.max(entries.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.covered
    }

    pub fn is_empty(&self) -> bool {
        self.covered == 0
    }
}

impl AnnBackend for HnswIndex {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn covered(&self) -> usize {
        self.covered
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Candidate>, bool), IndexError> {
        if self.is_empty() {
            return Err(IndexError::Unavailable("approximate graph is empty".to_string()));
        }
        if query.len() != self.dims {
            return Err(IndexError::Unavailable(format!(
                "graph holds {}-dim vectors, query has {}",
                self.dims,
                query.len()
            )));
        }
        if k == 0 {
            return Ok((Vec::new(), false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok((Vec::new(), true));
        }

        // Ids inserted by a newer extension are filtered out below
        let ahead = self.graph.get_nb_point().saturating_sub(self.covered);
        let fetch = k + ahead.min(k * 3);
        let found = self.graph.search(query, fetch, self.params.beam_width(fetch));

        let candidates = found
            .into_iter()
            .filter(|n| n.d_id < self.covered)
            .take(k)
            .map(|n| Candidate {
                position: n.d_id,
                score: 1.0 - n.distance,
            })
            .collect();
        let partial = deadline.is_some_and(|d| Instant::now() >= d);
        Ok((candidates, partial))
    }

    fn extended(&self, entries: &Entries) -> Arc<dyn AnnBackend> {
        Arc::new(self.insert_from(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::brute_force;
    use crate::models::pattern::{InstrumentType, Pattern, FINGERPRINT_DIMS};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn clustered_entries(count: usize, seed: u64) -> Entries {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers: Vec<Vec<f32>> = (0..40)
            .map(|_| (0..FINGERPRINT_DIMS).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect();
        (0..count).fold(Entries::default(), |entries, i| {
            let center = &centers[i % centers.len()];
            let v: Vec<f32> = center
                .iter()
                .map(|c| c + rng.gen_range(-0.15..0.15))
                .collect();
            entries.appended(Arc::new(Pattern::new(InstrumentType::Drums, v).unwrap()))
        })
    }

    fn params() -> AnnParams {
        AnnParams::from_config(&IndexConfig::default())
    }

    #[test]
    fn test_empty_graph_is_unavailable() {
        let graph = HnswIndex::build(params(), FINGERPRINT_DIMS, &Entries::default());
        let err = graph.search(&[0.5; FINGERPRINT_DIMS], 5, None).unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)));
    }

    #[test]
    fn test_finds_exact_member() {
        let entries = clustered_entries(500, 1);
        let graph = HnswIndex::build(params(), FINGERPRINT_DIMS, &entries);
        assert_eq!(graph.covered(), 500);

        let target = entries.get(123).unwrap();
        let (hits, partial) = graph.search(target.fingerprint(), 1, None).unwrap();
        assert!(!partial);
        assert_eq!(hits[0].position, 123);
    }

    #[test]
    fn test_recall_against_exact_scan() {
        let entries = clustered_entries(3000, 2);
        let graph = HnswIndex::build(params(), FINGERPRINT_DIMS, &entries);
        let queries = clustered_entries(100, 3);
        let k = 20;

        let mut overlap = 0usize;
        for query in queries.iter() {
            let (approx, _) = graph.search(query.fingerprint(), k, None).unwrap();
            let (exact, _) = brute_force::search(&entries, query.fingerprint(), k, None, None);
            let exact: HashSet<usize> = exact.iter().map(|c| c.position).collect();
            overlap += approx.iter().filter(|c| exact.contains(&c.position)).count();
        }

        let recall = overlap as f64 / (queries.len() * k) as f64;
        assert!(recall >= 0.95, "recall {} below target", recall);
    }

    #[test]
    fn test_extend_covers_new_entries() {
        let entries = clustered_entries(300, 4);
        let graph = HnswIndex::build(params(), FINGERPRINT_DIMS, &entries);

        let grown = clustered_entries(350, 4);
        let extended = graph.extended(&grown);
        assert_eq!(extended.covered(), 350);
        assert_eq!(graph.covered(), 300);

        let target = grown.get(340).unwrap();
        let (hits, _) = extended.search(target.fingerprint(), 1, None).unwrap();
        assert_eq!(hits[0].position, 340);

        // The older backend shares the graph but never reports uncovered ids
        let (old_hits, _) = graph.search(target.fingerprint(), 10, None).unwrap();
        assert!(old_hits.iter().all(|c| c.position < 300));
    }

    #[test]
    fn test_beam_width_grows_with_recall_target() {
        let mut p = params();
        let base = p.beam_width(60);
        p.recall_target = 0.99;
        assert!(p.beam_width(60) > base);
        assert!(p.beam_width(1) >= p.ef_search);
    }
}
