//! Pattern index
//!
//! One shard per instrument type; fingerprint spaces never cross. Each shard
//! publishes immutable snapshots through `ArcSwap`, so queries run lock-free
//! against whatever snapshot they loaded while inserts build and swap in the
//! next one under a per-shard writer lock.
//!
//! The retrieval backend is a pure function of shard size, re-evaluated on
//! insert only:
//! - below `brute_force_limit`: exact scan
//! - below `precomputed_limit`: precomputed neighbor lists for stored
//!   patterns, exact scan for ad-hoc vectors
//! - otherwise: approximate graph, with exact scan of the not yet indexed tail

pub mod ann;
pub mod brute_force;
pub mod entries;
pub mod similarity;

use crate::config::IndexConfig;
use crate::models::neighbor::{Neighbor, NeighborList};
use crate::models::pattern::{validate_fingerprint, InstrumentType, Pattern, PatternError};
use ann::{AnnBackend, AnnParams, HnswIndex};
use arc_swap::ArcSwap;
use brute_force::{Candidate, TopK};
use chrono::Utc;
use entries::{Entries, IdMap};
use midime_common::events::{EventBus, MidimeEvent};
use serde::Serialize;
use similarity::cosine_similarity;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Pattern index errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    /// Approximate backend cannot serve; callers fall back to an exact scan
    #[error("Approximate index unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid vector dimension for {instrument}: expected {expected}, got {actual}")]
    InvalidVectorDimension {
        instrument: InstrumentType,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid query vector: {0}")]
    InvalidVector(String),

    #[error("Unknown pattern: {0}")]
    UnknownPattern(Uuid),

    #[error("Pattern already indexed: {0}")]
    DuplicatePattern(Uuid),

    #[error("Index resources exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<PatternError> for IndexError {
    fn from(err: PatternError) -> Self {
        match err {
            PatternError::InvalidVectorDimension {
                instrument,
                expected,
                actual,
            } => IndexError::InvalidVectorDimension {
                instrument,
                expected,
                actual,
            },
            other => IndexError::InvalidVector(other.to_string()),
        }
    }
}

/// Retrieval strategy of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    BruteForce,
    Precomputed,
    Approximate,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::BruteForce => "brute_force",
            Backend::Precomputed => "precomputed",
            Backend::Approximate => "approximate",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend for a shard of `size` patterns
pub fn select_backend(size: usize, config: &IndexConfig) -> Backend {
    if size < config.brute_force_limit {
        Backend::BruteForce
    } else if size < config.precomputed_limit {
        Backend::Precomputed
    } else {
        Backend::Approximate
    }
}

/// Where query results came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    ExactScan,
    NeighborList,
    Approximate,
}

/// Index hit with the matched pattern
#[derive(Debug, Clone)]
pub struct ScoredPattern {
    pub pattern: Arc<Pattern>,
    /// Raw cosine similarity to the query
    pub score: f32,
}

impl ScoredPattern {
    pub fn pattern_id(&self) -> Uuid {
        self.pattern.pattern_id
    }
}

/// Query result; `partial` is set when the deadline cut the search short
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub hits: Vec<ScoredPattern>,
    pub partial: bool,
    pub source: QuerySource,
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub position: usize,
    pub backend: Backend,
    pub previous_backend: Backend,
    /// The approximate graph lags far enough behind to be refreshed
    pub ann_stale: bool,
}

/// Immutable view of one shard
#[derive(Debug, Clone)]
pub struct ShardSnapshot {
    instrument: InstrumentType,
    entries: Entries,
    ids: IdMap,
    backend: Backend,
    ann: Option<Arc<dyn AnnBackend>>,
}

impl ShardSnapshot {
    fn empty(instrument: InstrumentType) -> Self {
        Self {
            instrument,
            entries: Entries::default(),
            ids: IdMap::default(),
            backend: Backend::BruteForce,
            ann: None,
        }
    }

    pub fn instrument(&self) -> InstrumentType {
        self.instrument
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn pattern_at(&self, position: usize) -> Option<&Arc<Pattern>> {
        self.entries.get(position)
    }

    pub fn position_of(&self, pattern_id: &Uuid) -> Option<usize> {
        self.ids.get(pattern_id)
    }

    pub fn get(&self, pattern_id: &Uuid) -> Option<&Arc<Pattern>> {
        self.position_of(pattern_id)
            .and_then(|position| self.entries.get(position))
    }

    /// Patterns covered by the approximate graph
    pub fn ann_covered(&self) -> usize {
        self.ann.as_ref().map_or(0, |ann| ann.covered())
    }

    /// Exact top-k neighbors of the pattern at `position`, excluding itself
    pub fn exact_neighbors(&self, position: usize, k: usize) -> Vec<Neighbor> {
        let Some(pattern) = self.entries.get(position) else {
            return Vec::new();
        };
        let (candidates, _) =
            brute_force::search(&self.entries, pattern.fingerprint(), k, Some(position), None);
        self.to_neighbors(&candidates)
    }

    fn to_neighbors(&self, candidates: &[Candidate]) -> Vec<Neighbor> {
        candidates
            .iter()
            .filter_map(|c| {
                self.entries.get(c.position).map(|p| Neighbor {
                    pattern_id: p.pattern_id,
                    score: c.score,
                })
            })
            .collect()
    }

    fn to_hits(&self, candidates: Vec<Candidate>) -> Vec<ScoredPattern> {
        candidates
            .into_iter()
            .filter_map(|c| {
                self.entries.get(c.position).map(|p| ScoredPattern {
                    pattern: Arc::clone(p),
                    score: c.score,
                })
            })
            .collect()
    }
}

struct Shard {
    snapshot: ArcSwap<ShardSnapshot>,
    neighbor_lists: ArcSwap<HashMap<Uuid, Arc<NeighborList>>>,
    writer: Mutex<()>,
    ann_refreshing: AtomicBool,
}

impl Shard {
    fn new(instrument: InstrumentType) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ShardSnapshot::empty(instrument)),
            neighbor_lists: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
            ann_refreshing: AtomicBool::new(false),
        }
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`; a panicked writer leaves nothing half-built
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the refresh flag when a refresh ends, including by panic
struct RefreshFlag<'a>(&'a AtomicBool);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-memory corpus index
pub struct PatternIndex {
    config: IndexConfig,
    params: AnnParams,
    shards: HashMap<InstrumentType, Shard>,
    events: Option<EventBus>,
}

impl PatternIndex {
    pub fn new(config: IndexConfig) -> Self {
        let params = AnnParams::from_config(&config);
        let shards = InstrumentType::ALL
            .iter()
            .map(|instrument| (*instrument, Shard::new(*instrument)))
            .collect();
        Self {
            config,
            params,
            shards,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn shard(&self, instrument: InstrumentType) -> &Shard {
        // Every instrument gets a shard in `new`
        &self.shards[&instrument]
    }

    /// Current snapshot of one shard
    pub fn snapshot(&self, instrument: InstrumentType) -> Arc<ShardSnapshot> {
        self.shard(instrument).snapshot.load_full()
    }

    pub fn len(&self, instrument: InstrumentType) -> usize {
        self.shard(instrument).snapshot.load().len()
    }

    pub fn total_len(&self) -> usize {
        InstrumentType::ALL.iter().map(|i| self.len(*i)).sum()
    }

    pub fn backend(&self, instrument: InstrumentType) -> Backend {
        self.shard(instrument).snapshot.load().backend
    }

    /// Snapshot holding `pattern_id`, searching every shard
    fn locate(&self, pattern_id: &Uuid) -> Option<(Arc<ShardSnapshot>, usize)> {
        InstrumentType::ALL.iter().find_map(|instrument| {
            let snapshot = self.snapshot(*instrument);
            snapshot
                .position_of(pattern_id)
                .map(|position| (snapshot, position))
        })
    }

    pub fn get(&self, pattern_id: &Uuid) -> Option<Arc<Pattern>> {
        self.locate(pattern_id)
            .and_then(|(snapshot, position)| snapshot.pattern_at(position).cloned())
    }

    /// Add a pattern and re-evaluate the shard's backend
    pub fn insert(&self, pattern: Pattern) -> Result<InsertOutcome, IndexError> {
        let instrument = pattern.instrument_type;
        if let Err(e) = validate_fingerprint(instrument, pattern.fingerprint()) {
            tracing::error!(pattern_id = %pattern.pattern_id, error = %e, "Rejected malformed fingerprint");
            return Err(e.into());
        }

        let shard = self.shard(instrument);
        let _writer = shard.write_lock();
        let current = shard.snapshot.load_full();

        if current.ids.contains(&pattern.pattern_id) {
            return Err(IndexError::DuplicatePattern(pattern.pattern_id));
        }

        let pattern_id = pattern.pattern_id;
        let position = current.entries.len();
        let size = position + 1;
        let backend = select_backend(size, &self.config);

        let next = ShardSnapshot {
            instrument,
            entries: current.entries.appended(Arc::new(pattern)),
            ids: current.ids.inserted(pattern_id, position),
            backend,
            ann: current.ann.clone(),
        };
        let ann_stale = self.ann_stale(&next);
        shard.snapshot.store(Arc::new(next));

        if backend != current.backend {
            self.announce_backend(instrument, current.backend, backend, size);
        }

        Ok(InsertOutcome {
            position,
            backend,
            previous_backend: current.backend,
            ann_stale,
        })
    }

    /// Replace a shard's contents with stored patterns, in stored order
    ///
    /// Used once at startup; builds the snapshot without publishing each
    /// intermediate state.
    pub fn load(&self, instrument: InstrumentType, patterns: Vec<Pattern>) -> Result<usize, IndexError> {
        let shard = self.shard(instrument);
        let _writer = shard.write_lock();

        let mut entries = Entries::default();
        let mut ids = IdMap::default();
        for pattern in patterns {
            if pattern.instrument_type != instrument {
                return Err(IndexError::InvalidVector(format!(
                    "{} pattern {} loaded into {} shard",
                    pattern.instrument_type, pattern.pattern_id, instrument
                )));
            }
            validate_fingerprint(instrument, pattern.fingerprint())?;
            if ids.contains(&pattern.pattern_id) {
                return Err(IndexError::DuplicatePattern(pattern.pattern_id));
            }
            ids.insert(pattern.pattern_id, entries.len());
            entries.push(Arc::new(pattern));
        }

        let size = entries.len();
        let backend = select_backend(size, &self.config);
        shard.snapshot.store(Arc::new(ShardSnapshot {
            instrument,
            entries,
            ids,
            backend,
            ann: None,
        }));

        tracing::info!(instrument = %instrument, patterns = size, backend = %backend, "Loaded index shard");
        Ok(size)
    }

    fn ann_stale(&self, snapshot: &ShardSnapshot) -> bool {
        snapshot.backend == Backend::Approximate
            && (snapshot.ann.is_none()
                || snapshot.len() - snapshot.ann_covered() >= self.config.ann_rebuild_tail.max(1))
    }

    fn announce_backend(&self, instrument: InstrumentType, from: Backend, to: Backend, size: usize) {
        tracing::info!(
            instrument = %instrument,
            from = %from,
            to = %to,
            corpus_size = size,
            "Index backend changed"
        );
        if let Some(events) = &self.events {
            events.emit_lossy(MidimeEvent::BackendChanged {
                instrument_type: instrument.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                corpus_size: size,
                timestamp: Utc::now(),
            });
        }
    }

    /// Whether the shard's approximate graph should be built or extended
    pub fn needs_ann_refresh(&self, instrument: InstrumentType) -> bool {
        self.ann_stale(&self.shard(instrument).snapshot.load())
    }

    /// Build or extend the approximate graph of a shard (CPU bound)
    ///
    /// Returns false when the shard does not use the approximate backend or
    /// another refresh is already running. Queries keep using the previous
    /// graph plus an exact tail scan until the new graph is published.
    pub fn refresh_ann(&self, instrument: InstrumentType) -> bool {
        let shard = self.shard(instrument);
        if shard
            .ann_refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _flag = RefreshFlag(&shard.ann_refreshing);

        let snapshot = shard.snapshot.load_full();
        if snapshot.backend != Backend::Approximate {
            return false;
        }

        let started = Instant::now();
        let graph: Arc<dyn AnnBackend> = match &snapshot.ann {
            Some(existing) => existing.extended(&snapshot.entries),
            None => Arc::new(HnswIndex::build(
                self.params,
                instrument.fingerprint_dims(),
                &snapshot.entries,
            )),
        };
        let covered = graph.covered();
        let graph_name = graph.name();

        {
            let _writer = shard.write_lock();
            let current = shard.snapshot.load_full();
            // A concurrent refresh cannot run; only publish if ours is newer
            if current.ann_covered() < covered {
                let mut next = ShardSnapshot::clone(&current);
                next.ann = Some(graph);
                shard.snapshot.store(Arc::new(next));
            }
        }

        tracing::info!(
            instrument = %instrument,
            graph = graph_name,
            covered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Approximate index refreshed"
        );
        true
    }

    /// Top-k stored patterns closest to an arbitrary vector
    pub fn query(
        &self,
        vector: &[f32],
        instrument: InstrumentType,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<QueryOutcome, IndexError> {
        if let Err(e) = validate_fingerprint(instrument, vector) {
            tracing::error!(instrument = %instrument, error = %e, "Query vector rejected");
            return Err(e.into());
        }
        let snapshot = self.snapshot(instrument);
        self.search(&snapshot, vector, k, None, deadline)
    }

    /// Top-k patterns closest to a stored pattern, excluding itself
    ///
    /// Served from the pattern's neighbor list when the shard uses
    /// precomputed lists and one is materialized. A list holds at most
    /// `neighbor_list_len` entries, which caps the hits served from it.
    pub fn query_pattern(
        &self,
        pattern_id: Uuid,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<QueryOutcome, IndexError> {
        let (snapshot, position) = self
            .locate(&pattern_id)
            .ok_or(IndexError::UnknownPattern(pattern_id))?;

        if snapshot.backend == Backend::Precomputed {
            let lists = self.shard(snapshot.instrument).neighbor_lists.load();
            if let Some(list) = lists.get(&pattern_id) {
                // Entries no longer in the snapshot are skipped until the next rebuild
                let hits = list
                    .neighbors
                    .iter()
                    .filter_map(|n| {
                        snapshot.get(&n.pattern_id).map(|p| ScoredPattern {
                            pattern: Arc::clone(p),
                            score: n.score,
                        })
                    })
                    .take(k)
                    .collect();
                return Ok(QueryOutcome {
                    hits,
                    partial: false,
                    source: QuerySource::NeighborList,
                });
            }
        }

        let pattern = snapshot
            .pattern_at(position)
            .cloned()
            .ok_or(IndexError::UnknownPattern(pattern_id))?;
        self.search(&snapshot, pattern.fingerprint(), k, Some(position), deadline)
    }

    fn search(
        &self,
        snapshot: &ShardSnapshot,
        vector: &[f32],
        k: usize,
        exclude: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<QueryOutcome, IndexError> {
        if snapshot.backend == Backend::Approximate {
            match self.search_approximate(snapshot, vector, k, exclude, deadline) {
                Ok(outcome) => return Ok(outcome),
                Err(IndexError::Unavailable(reason)) => {
                    tracing::warn!(
                        instrument = %snapshot.instrument,
                        reason = %reason,
                        "Approximate index unavailable, degrading to exact scan"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let (candidates, partial) =
            brute_force::search(&snapshot.entries, vector, k, exclude, deadline);
        Ok(QueryOutcome {
            hits: snapshot.to_hits(candidates),
            partial,
            source: QuerySource::ExactScan,
        })
    }

    /// Graph search over the covered prefix merged with an exact tail scan
    fn search_approximate(
        &self,
        snapshot: &ShardSnapshot,
        vector: &[f32],
        k: usize,
        exclude: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<QueryOutcome, IndexError> {
        let ann = snapshot
            .ann
            .as_ref()
            .ok_or_else(|| IndexError::Unavailable("approximate graph not built yet".to_string()))?;

        let fetch = k + usize::from(exclude.is_some());
        let (approximate, graph_partial) = ann.search(vector, fetch, deadline)?;

        // Re-score exactly so scores match the other backends bit for bit
        let mut top = TopK::new(k);
        for candidate in approximate {
            if Some(candidate.position) == exclude {
                continue;
            }
            if let Some(pattern) = snapshot.entries.get(candidate.position) {
                top.push(Candidate {
                    position: candidate.position,
                    score: cosine_similarity(vector, pattern.fingerprint()),
                });
            }
        }
        let tail_complete = brute_force::scan_into(
            &snapshot.entries,
            ann.covered(),
            vector,
            exclude,
            deadline,
            &mut top,
        );

        Ok(QueryOutcome {
            hits: snapshot.to_hits(top.into_sorted()),
            partial: graph_partial || !tail_complete,
            source: QuerySource::Approximate,
        })
    }

    /// Publish neighbor lists for one shard
    pub fn publish_neighbor_lists(&self, instrument: InstrumentType, lists: Vec<NeighborList>) {
        if lists.is_empty() {
            return;
        }
        let lists: Vec<Arc<NeighborList>> = lists.into_iter().map(Arc::new).collect();
        self.shard(instrument).neighbor_lists.rcu(|current| {
            let mut next = HashMap::clone(current);
            for list in &lists {
                next.insert(list.pattern_id, Arc::clone(list));
            }
            next
        });
    }

    pub fn neighbor_list(&self, pattern_id: &Uuid) -> Option<Arc<NeighborList>> {
        InstrumentType::ALL.iter().find_map(|instrument| {
            self.shard(*instrument)
                .neighbor_lists
                .load()
                .get(pattern_id)
                .cloned()
        })
    }

    /// Current neighbor lists of one shard
    pub fn neighbor_lists(&self, instrument: InstrumentType) -> Arc<HashMap<Uuid, Arc<NeighborList>>> {
        self.shard(instrument).neighbor_lists.load_full()
    }

    pub fn neighbor_list_count(&self, instrument: InstrumentType) -> usize {
        self.shard(instrument).neighbor_lists.load().len()
    }

    /// Replace a pattern's quality score, the only mutable pattern field
    pub fn update_quality(&self, pattern_id: Uuid, quality_score: f32) -> Result<(), IndexError> {
        for instrument in InstrumentType::ALL {
            let shard = self.shard(instrument);
            let _writer = shard.write_lock();
            let current = shard.snapshot.load_full();
            let Some(position) = current.position_of(&pattern_id) else {
                continue;
            };
            let Some(existing) = current.pattern_at(position) else {
                continue;
            };

            let mut updated = Pattern::clone(existing);
            updated.quality_score = quality_score;

            let entries = current
                .entries
                .replaced(position, Arc::new(updated))
                .ok_or(IndexError::UnknownPattern(pattern_id))?;
            let mut next = ShardSnapshot::clone(&current);
            next.entries = entries;
            shard.snapshot.store(Arc::new(next));

            tracing::debug!(%pattern_id, quality_score, "Quality score updated");
            return Ok(());
        }
        Err(IndexError::UnknownPattern(pattern_id))
    }
}
