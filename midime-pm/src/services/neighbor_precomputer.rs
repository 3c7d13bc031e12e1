//! Neighbor precomputer
//!
//! Background job that keeps precomputed neighbor lists current for shards
//! served by the `Precomputed` backend.
//!
//! State machine: `Idle -> Scheduled -> Running -> Idle`.
//! - `Idle -> Scheduled`: inserts since the last run reach the threshold, or
//!   the interval timer fires while work is pending
//! - `Scheduled -> Running`: the worker loop picks the run up
//! - `Running -> Idle`: the run completed, was cancelled, or exhausted its
//!   retry budget
//!
//! A run works in bounded batches against one shard snapshot. Each batch is
//! written in a single transaction, so cancelling between batches never leaves
//! a partial list behind.

use crate::config::PrecomputeConfig;
use crate::db::neighbors;
use crate::index::{Backend, InsertOutcome, PatternIndex, ShardSnapshot};
use crate::index::similarity::cosine_similarity;
use crate::models::neighbor::NeighborList;
use crate::models::pattern::InstrumentType;
use chrono::Utc;
use midime_common::events::{EventBus, MidimeEvent};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PrecomputeError {
    #[error("Neighbor list storage error: {0}")]
    Storage(#[from] midime_common::Error),

    #[error("Neighbor computation task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecomputeState {
    Idle,
    Scheduled,
    Running,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub lists_written: usize,
    pub batches: usize,
    /// Stopped at a batch boundary; unfinished work stays pending
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Targets {
    /// Every pattern in the shard
    All,
    /// Inserted patterns; patterns whose lists they displace are added at run time
    Inserted(HashSet<Uuid>),
}

impl Targets {
    fn merge(&mut self, other: Targets) {
        match (self, other) {
            (Targets::All, _) => {}
            (this, Targets::All) => *this = Targets::All,
            (Targets::Inserted(ids), Targets::Inserted(more)) => ids.extend(more),
        }
    }
}

#[derive(Debug)]
struct Pending {
    state: PrecomputeState,
    work: BTreeMap<InstrumentType, Targets>,
    inserts_since_run: usize,
}

impl Pending {
    fn requeue(&mut self, instrument: InstrumentType, targets: Targets) {
        match self.work.get_mut(&instrument) {
            Some(existing) => existing.merge(targets),
            None => {
                self.work.insert(instrument, targets);
            }
        }
    }
}

pub struct NeighborPrecomputer {
    pool: SqlitePool,
    index: Arc<PatternIndex>,
    config: PrecomputeConfig,
    list_len: usize,
    events: Option<EventBus>,
    pending: Mutex<Pending>,
    wake: Notify,
}

impl NeighborPrecomputer {
    pub fn new(pool: SqlitePool, index: Arc<PatternIndex>, config: PrecomputeConfig) -> Self {
        let list_len = index.config().neighbor_list_len;
        Self {
            pool,
            index,
            config,
            list_len,
            events: None,
            pending: Mutex::new(Pending {
                state: PrecomputeState::Idle,
                work: BTreeMap::new(),
                inserts_since_run: 0,
            }),
            wake: Notify::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PrecomputeState {
        self.lock().state
    }

    /// Whether any shard has work waiting for the next run
    pub fn has_pending(&self) -> bool {
        !self.lock().work.is_empty()
    }

    /// Record an index insert
    ///
    /// A shard entering the precomputed range gets a full build; inserts into
    /// a shard already in that range mark the new pattern dirty. Other
    /// backends never read neighbor lists and are not tracked.
    pub fn note_insert(&self, pattern_id: Uuid, instrument: InstrumentType, outcome: &InsertOutcome) {
        let mut pending = self.lock();
        pending.inserts_since_run += 1;

        if outcome.backend == Backend::Precomputed {
            if outcome.previous_backend != Backend::Precomputed {
                tracing::info!(instrument = %instrument, "Shard entered precomputed range, scheduling full build");
                pending.requeue(instrument, Targets::All);
            } else {
                pending.requeue(instrument, Targets::Inserted(HashSet::from([pattern_id])));
            }
        }

        if pending.state == PrecomputeState::Idle
            && !pending.work.is_empty()
            && pending.inserts_since_run >= self.config.insert_threshold
        {
            pending.state = PrecomputeState::Scheduled;
            drop(pending);
            self.wake.notify_one();
        }
    }

    /// Queue a full rebuild of one shard's lists
    pub fn request_full_build(&self, instrument: InstrumentType) {
        self.lock().requeue(instrument, Targets::All);
    }

    /// Schedule a run now if there is pending work
    pub fn schedule(&self) -> bool {
        let mut pending = self.lock();
        if pending.state != PrecomputeState::Idle || pending.work.is_empty() {
            return false;
        }
        pending.state = PrecomputeState::Scheduled;
        drop(pending);
        self.wake.notify_one();
        true
    }

    fn begin_run(&self) -> bool {
        let mut pending = self.lock();
        if pending.state != PrecomputeState::Scheduled {
            return false;
        }
        pending.state = PrecomputeState::Running;
        pending.inserts_since_run = 0;
        true
    }

    fn finish_run(&self) {
        self.lock().state = PrecomputeState::Idle;
    }

    /// Worker loop; returns when `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.config.interval().as_secs(),
            insert_threshold = self.config.insert_threshold,
            "Neighbor precomputer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {
                    self.schedule();
                }
            }

            if self.begin_run() {
                self.run_with_retry(&cancel).await;
                self.finish_run();
            }
        }

        tracing::info!("Neighbor precomputer stopped");
    }

    /// Run with the retry budget
    ///
    /// Exhausting the budget raises `PrecomputeFailed`; pending work is kept
    /// for the next scheduled run and queries keep using exact scans.
    pub async fn run_with_retry(&self, cancel: &CancellationToken) -> Option<RunReport> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.run_once(cancel).await {
                Ok(report) => return Some(report),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                tracing::error!(attempts = attempt, error = %err, "Neighbor precompute failed, retry budget exhausted");
                if let Some(events) = &self.events {
                    events.emit_lossy(MidimeEvent::PrecomputeFailed {
                        attempts: attempt,
                        error: err.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                return None;
            }

            let backoff = self.config.backoff(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Neighbor precompute failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    /// Recompute lists for all pending work
    ///
    /// Work not finished because of an error or cancellation is requeued.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport, PrecomputeError> {
        let work = std::mem::take(&mut self.lock().work);
        let mut report = RunReport::default();
        let mut remaining = work.into_iter();

        while let Some((instrument, targets)) = remaining.next() {
            let (unfinished, err) = match self.run_shard(instrument, targets, cancel, &mut report).await {
                Ok(None) => continue,
                Ok(Some(rest)) => (rest, None),
                Err((rest, e)) => (rest, Some(e)),
            };

            let mut pending = self.lock();
            pending.requeue(instrument, unfinished);
            for (instrument, targets) in remaining.by_ref() {
                pending.requeue(instrument, targets);
            }
            drop(pending);

            return match err {
                Some(e) => Err(e),
                None => {
                    report.cancelled = true;
                    tracing::info!(lists_written = report.lists_written, "Neighbor precompute cancelled");
                    Ok(report)
                }
            };
        }

        if report.lists_written > 0 {
            tracing::info!(
                lists_written = report.lists_written,
                batches = report.batches,
                "Neighbor precompute finished"
            );
        }
        Ok(report)
    }

    /// Process one shard
    ///
    /// Returns `Ok(None)` when finished, `Ok(Some(rest))` when cancelled and
    /// `Err((rest, error))` on failure, `rest` being the unprocessed targets.
    async fn run_shard(
        &self,
        instrument: InstrumentType,
        targets: Targets,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Option<Targets>, (Targets, PrecomputeError)> {
        let snapshot = self.index.snapshot(instrument);
        if snapshot.backend() != Backend::Precomputed {
            tracing::debug!(instrument = %instrument, backend = %snapshot.backend(), "Shard does not use neighbor lists, dropping work");
            return Ok(None);
        }

        let positions = match self.target_positions(&snapshot, &targets).await {
            Ok(positions) => positions,
            Err(e) => return Err((targets, e)),
        };

        let batch_size = self.config.batch_size.max(1);
        let mut offset = 0;
        while offset < positions.len() {
            let rest = || Targets::Inserted(ids_at(&snapshot, &positions[offset..]));
            if cancel.is_cancelled() {
                return Ok(Some(rest()));
            }

            let batch: Vec<usize> = positions[offset..(offset + batch_size).min(positions.len())].to_vec();
            let written = match self.write_batch(&snapshot, batch).await {
                Ok(written) => written,
                Err(e) => return Err((rest(), e)),
            };

            offset += written;
            report.lists_written += written;
            report.batches += 1;
        }

        Ok(None)
    }

    /// Positions to recompute, in shard order
    async fn target_positions(
        &self,
        snapshot: &Arc<ShardSnapshot>,
        targets: &Targets,
    ) -> Result<Vec<usize>, PrecomputeError> {
        match targets {
            Targets::All => Ok((0..snapshot.len()).collect()),
            Targets::Inserted(ids) => {
                let inserted: Vec<usize> = ids.iter().filter_map(|id| snapshot.position_of(id)).collect();
                let lists = self.index.neighbor_lists(snapshot.instrument());
                let snapshot = Arc::clone(snapshot);
                let list_len = self.list_len;
                tokio::task::spawn_blocking(move || affected_positions(&snapshot, &lists, &inserted, list_len))
                    .await
                    .map_err(|e| PrecomputeError::Task(e.to_string()))
            }
        }
    }

    async fn write_batch(&self, snapshot: &Arc<ShardSnapshot>, batch: Vec<usize>) -> Result<usize, PrecomputeError> {
        let instrument = snapshot.instrument();
        let list_len = self.list_len;
        let snap = Arc::clone(snapshot);
        let lists = tokio::task::spawn_blocking(move || {
            let computed_at = Utc::now();
            batch
                .iter()
                .filter_map(|&position| {
                    let pattern_id = snap.pattern_at(position)?.pattern_id;
                    let mut list = NeighborList::new(
                        pattern_id,
                        instrument,
                        snap.exact_neighbors(position, list_len),
                        list_len,
                    );
                    list.computed_at = computed_at;
                    Some(list)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PrecomputeError::Task(e.to_string()))?;

        neighbors::replace_lists(&self.pool, &lists).await?;

        let written = lists.len();
        self.index.publish_neighbor_lists(instrument, lists);
        tracing::debug!(instrument = %instrument, lists = written, "Neighbor lists published");
        if let Some(events) = &self.events {
            events.emit_lossy(MidimeEvent::NeighborListsPublished {
                instrument_type: instrument.to_string(),
                lists: written,
                timestamp: Utc::now(),
            });
        }
        Ok(written)
    }
}

fn ids_at(snapshot: &ShardSnapshot, positions: &[usize]) -> HashSet<Uuid> {
    positions
        .iter()
        .filter_map(|&p| snapshot.pattern_at(p).map(|pattern| pattern.pattern_id))
        .collect()
}

/// Inserted positions plus every pattern whose list they would change
///
/// A stored list changes when it is missing, still short of `list_len`, or
/// one of the inserted patterns outscores its weakest entry.
fn affected_positions(
    snapshot: &ShardSnapshot,
    lists: &HashMap<Uuid, Arc<NeighborList>>,
    inserted: &[usize],
    list_len: usize,
) -> Vec<usize> {
    let inserted_set: HashSet<usize> = inserted.iter().copied().collect();
    let reachable = list_len.min(snapshot.len().saturating_sub(1));
    let mut affected = Vec::new();

    for position in 0..snapshot.len() {
        if inserted_set.contains(&position) {
            affected.push(position);
            continue;
        }
        let Some(pattern) = snapshot.pattern_at(position) else {
            continue;
        };
        let Some(list) = lists.get(&pattern.pattern_id) else {
            affected.push(position);
            continue;
        };
        if list.len() < reachable {
            affected.push(position);
            continue;
        }
        let floor = list.neighbors.last().map_or(f32::NEG_INFINITY, |n| n.score);
        let displaced = inserted.iter().any(|&i| {
            snapshot
                .pattern_at(i)
                .is_some_and(|new| cosine_similarity(new.fingerprint(), pattern.fingerprint()) > floor)
        });
        if displaced {
            affected.push(position);
        }
    }
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::db::init_tables;
    use crate::index::QuerySource;
    use crate::models::pattern::{Pattern, FINGERPRINT_DIMS};
    use midime_common::db::init_memory_database;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn index_config() -> IndexConfig {
        IndexConfig {
            brute_force_limit: 5,
            precomputed_limit: 10_000,
            neighbor_list_len: 4,
            ..IndexConfig::default()
        }
    }

    fn precompute_config() -> PrecomputeConfig {
        PrecomputeConfig {
            insert_threshold: 10,
            interval_secs: 3_600,
            batch_size: 8,
            max_attempts: 3,
            backoff_base_ms: 1,
        }
    }

    fn random_pattern(rng: &mut StdRng) -> Pattern {
        let v: Vec<f32> = (0..FINGERPRINT_DIMS).map(|_| rng.gen_range(0.0..1.0)).collect();
        Pattern::new(InstrumentType::Drums, v).unwrap()
    }

    async fn setup() -> (Arc<PatternIndex>, NeighborPrecomputer, SqlitePool) {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();
        let index = Arc::new(PatternIndex::new(index_config()));
        let precomputer = NeighborPrecomputer::new(pool.clone(), Arc::clone(&index), precompute_config());
        (index, precomputer, pool)
    }

    fn insert(index: &PatternIndex, precomputer: &NeighborPrecomputer, pattern: Pattern) -> Uuid {
        let id = pattern.pattern_id;
        let outcome = index.insert(pattern).unwrap();
        precomputer.note_insert(id, InstrumentType::Drums, &outcome);
        id
    }

    #[tokio::test]
    async fn test_full_build_when_entering_precomputed_range() {
        let (index, precomputer, pool) = setup().await;
        let mut rng = StdRng::seed_from_u64(11);
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(insert(&index, &precomputer, random_pattern(&mut rng)));
        }
        assert!(precomputer.has_pending());

        let report = precomputer.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.lists_written, 20);
        assert_eq!(report.batches, 3);
        assert!(!precomputer.has_pending());

        let stored = neighbors::load_lists(&pool, InstrumentType::Drums).await.unwrap();
        assert_eq!(stored.len(), 20);
        assert!(stored.iter().all(|l| l.len() == 4));

        let outcome = index.query_pattern(ids[0], 4, None).unwrap();
        assert_eq!(outcome.source, QuerySource::NeighborList);
    }

    #[tokio::test]
    async fn test_insert_refreshes_displaced_lists() {
        let (index, precomputer, _pool) = setup().await;
        let mut rng = StdRng::seed_from_u64(12);
        let mut patterns = Vec::new();
        for _ in 0..20 {
            let p = random_pattern(&mut rng);
            patterns.push(p.clone());
            insert(&index, &precomputer, p);
        }
        precomputer.run_once(&CancellationToken::new()).await.unwrap();

        // A near copy of pattern 3 must enter its list
        let mut twin_vector = patterns[3].fingerprint().to_vec();
        twin_vector[0] += 0.001;
        let twin = Pattern::new(InstrumentType::Drums, twin_vector).unwrap();
        let twin_id = insert(&index, &precomputer, twin);

        let report = precomputer.run_once(&CancellationToken::new()).await.unwrap();
        assert!(report.lists_written >= 2);
        assert!(report.lists_written < 21);

        let list = index.neighbor_list(&patterns[3].pattern_id).unwrap();
        assert_eq!(list.neighbors[0].pattern_id, twin_id);
        let own = index.neighbor_list(&twin_id).unwrap();
        assert_eq!(own.neighbors[0].pattern_id, patterns[3].pattern_id);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_pending_work() {
        let (index, precomputer, _pool) = setup().await;
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..20 {
            insert(&index, &precomputer, random_pattern(&mut rng));
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = precomputer.run_once(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.lists_written, 0);
        assert!(precomputer.has_pending());

        let report = precomputer.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.lists_written, 20);
    }

    #[tokio::test]
    async fn test_brute_force_shards_are_not_tracked() {
        let (index, precomputer, _pool) = setup().await;
        let mut rng = StdRng::seed_from_u64(14);
        for _ in 0..4 {
            insert(&index, &precomputer, random_pattern(&mut rng));
        }
        assert!(!precomputer.has_pending());
        assert!(!precomputer.schedule());
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_alert() {
        let (index, precomputer, pool) = setup().await;
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let precomputer = precomputer.with_events(bus);
        let mut rng = StdRng::seed_from_u64(15);
        for _ in 0..10 {
            insert(&index, &precomputer, random_pattern(&mut rng));
        }

        pool.close().await;
        let report = precomputer.run_with_retry(&CancellationToken::new()).await;
        assert!(report.is_none());
        assert!(precomputer.has_pending());

        loop {
            match rx.recv().await.unwrap() {
                MidimeEvent::PrecomputeFailed { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_worker_loop_runs_when_threshold_reached() {
        let (index, precomputer, _pool) = setup().await;
        let precomputer = Arc::new(precomputer);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&precomputer).run(cancel.clone()));

        let mut rng = StdRng::seed_from_u64(16);
        for _ in 0..12 {
            insert(&index, &precomputer, random_pattern(&mut rng));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while index.neighbor_list_count(InstrumentType::Drums) < 12 {
            assert!(tokio::time::Instant::now() < deadline, "precompute did not run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        while precomputer.state() != PrecomputeState::Idle {
            assert!(tokio::time::Instant::now() < deadline, "precompute did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        worker.await.unwrap();
    }
}
