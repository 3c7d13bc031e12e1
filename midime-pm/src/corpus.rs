//! Corpus
//!
//! Process-wide matcher state: the duplicate guard, the pattern index and the
//! neighbor precomputer, initialized from the persisted store. Every mutation
//! of that state goes through `ingest` or `update_quality`.

use crate::config::MatcherConfig;
use crate::db::{self, neighbors, patterns, reviews};
use crate::index::{Backend, IndexError, PatternIndex, QueryOutcome};
use crate::models::pattern::{InstrumentType, Pattern, PatternError};
use crate::models::submission::{SourceFile, SourceIdentity, Submission};
use crate::models::tier::{Tier, TierPolicies};
use crate::services::acoustic_digest::{self, DecodedAudio, DigestError};
use crate::services::duplicate_guard::{Decision, DuplicateGuard, GuardError, GuardRequest, MatchLevel};
use crate::services::fingerprint_builder::{FingerprintBuilder, FingerprintError};
use crate::services::neighbor_precomputer::NeighborPrecomputer;
use crate::services::similarity_ranker::{RankError, RankRequest, RankedResults, SimilarityRanker};
use crate::utils::retry_on_lock;
use chrono::Utc;
use midime_common::events::{EventBus, MidimeEvent};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Broadcast capacity of the corpus event bus
pub const EVENT_CAPACITY: usize = 1024;

/// Corpus errors
///
/// Construction errors abort only the pattern being ingested; duplicate and
/// tier outcomes are `IngestOutcome::Rejected`, not errors.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Rank(#[from] RankError),

    #[error(transparent)]
    Storage(#[from] midime_common::Error),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Result of one ingestion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Admitted {
        pattern_id: Uuid,
        source_song_id: Uuid,
        match_level: MatchLevel,
        backend: Backend,
    },
    Rejected {
        decision: Decision,
    },
}

pub struct Corpus {
    pool: SqlitePool,
    config: MatcherConfig,
    policies: TierPolicies,
    builder: FingerprintBuilder,
    guard: DuplicateGuard,
    index: Arc<PatternIndex>,
    ranker: Arc<SimilarityRanker>,
    precomputer: Arc<NeighborPrecomputer>,
    events: EventBus,
}

impl Corpus {
    /// Rebuild in-memory state from the persisted store
    ///
    /// **Algorithm:**
    /// 1. Ensure the matcher tables exist
    /// 2. Load song digests into the duplicate guard
    /// 3. Load patterns per instrument in stored order and select backends
    /// 4. Publish stored neighbor lists; queue a full build for precomputed
    ///    shards with missing lists
    /// 5. Build approximate graphs for shards past the precomputed range
    pub async fn load(pool: SqlitePool, config: MatcherConfig, events: EventBus) -> Result<Self, CorpusError> {
        let started = Instant::now();
        config.validate()?;
        let policies = config.tier_policies()?;

        db::init_tables(&pool).await?;

        let guard = DuplicateGuard::load(pool.clone(), config.dedup.clone()).await?;
        let index = Arc::new(PatternIndex::new(config.index.clone()).with_events(events.clone()));
        let precomputer = Arc::new(
            NeighborPrecomputer::new(pool.clone(), Arc::clone(&index), config.precompute.clone())
                .with_events(events.clone()),
        );

        let mut by_instrument: BTreeMap<InstrumentType, Vec<Pattern>> = BTreeMap::new();
        for pattern in patterns::load_patterns(&pool).await? {
            by_instrument.entry(pattern.instrument_type).or_default().push(pattern);
        }

        for instrument in InstrumentType::ALL {
            let shard_patterns = by_instrument.remove(&instrument).unwrap_or_default();
            let size = index.load(instrument, shard_patterns)?;

            match index.backend(instrument) {
                Backend::BruteForce => {}
                Backend::Precomputed => {
                    let lists = neighbors::load_lists(&pool, instrument).await?;
                    let stored = lists.len();
                    index.publish_neighbor_lists(instrument, lists);
                    if index.neighbor_list_count(instrument) < size {
                        tracing::info!(
                            instrument = %instrument,
                            stored_lists = stored,
                            patterns = size,
                            "Neighbor lists incomplete, queueing full build"
                        );
                        precomputer.request_full_build(instrument);
                    }
                }
                Backend::Approximate => {
                    let index = Arc::clone(&index);
                    tokio::task::spawn_blocking(move || index.refresh_ann(instrument))
                        .await
                        .map_err(|e| CorpusError::Task(e.to_string()))?;
                }
            }
        }

        tracing::info!(
            patterns = index.total_len(),
            sources = guard.source_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Corpus loaded"
        );

        Ok(Self {
            pool,
            ranker: Arc::new(SimilarityRanker::new(Arc::clone(&index))),
            config,
            policies,
            builder: FingerprintBuilder::new(),
            guard,
            index,
            precomputer,
            events,
        })
    }

    pub fn index(&self) -> &Arc<PatternIndex> {
        &self.index
    }

    pub fn precomputer(&self) -> &Arc<NeighborPrecomputer> {
        &self.precomputer
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Start the neighbor precomputer on the runtime
    pub fn spawn_precomputer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        // Lists may be incomplete after load
        self.precomputer.schedule();
        tokio::spawn(Arc::clone(&self.precomputer).run(cancel))
    }

    /// Validate an upload and compute its source identity
    pub async fn identify_source(
        &self,
        file: &SourceFile,
        audio: DecodedAudio,
        bytes: Vec<u8>,
    ) -> Result<SourceIdentity, CorpusError> {
        file.validate().map_err(CorpusError::InvalidUpload)?;
        let duration_s = audio.duration_seconds();
        let source = tokio::task::spawn_blocking(move || acoustic_digest::digest(&audio, &bytes))
            .await
            .map_err(|e| CorpusError::Task(e.to_string()))??;

        Ok(SourceIdentity {
            acoustic_digest: source.acoustic_digest,
            file_hash: source.file_hash,
            duration_s,
        })
    }

    /// Admit one analyzed pattern
    ///
    /// **Algorithm:**
    /// 1. Build the fingerprint (fails fast on bad onset data)
    /// 2. Run the duplicate guard under the submitter's tier policy
    /// 3. Persist the pattern in the same transaction as its section, then
    ///    insert it into the index; an index failure revokes the admission
    /// 4. Notify the precomputer; refresh the approximate graph in the
    ///    background when it lags too far behind
    pub async fn ingest(&self, submission: Submission) -> Result<IngestOutcome, CorpusError> {
        let analyzed = &submission.pattern;
        let fingerprint = self.builder.build(
            analyzed.instrument_type,
            &analyzed.onsets,
            analyzed.tempo_bpm,
            analyzed.bar_length_s,
        )?;
        // Source id is assigned by the guard on admission
        let pattern = Pattern::new(analyzed.instrument_type, fingerprint)?
            .with_source(submission.song_id, Uuid::nil())
            .with_tempo(analyzed.tempo_bpm as f32)
            .with_key(analyzed.detected_key.clone())
            .with_genre(analyzed.detected_genre.clone())
            .with_section(submission.section_label.clone())
            .with_quality(submission.quality_score);

        let policy = self.policies.resolve(submission.tier);
        let decision = self
            .guard
            .check(&GuardRequest {
                acoustic_digest: &submission.source.acoustic_digest,
                file_hash: &submission.source.file_hash,
                duration_s: submission.source.duration_s,
                tempo_bpm: analyzed.tempo_bpm,
                detected_key: &analyzed.detected_key,
                source_song_id_candidate: submission.source_song_id_candidate,
                user_id: submission.user_id,
                tier: submission.tier,
                policy: &policy,
                section_label: &submission.section_label,
                pattern: Some(&pattern),
            })
            .await?;

        let (source_song_id, match_level) = match &decision {
            Decision::Allow {
                source_song_id,
                match_level,
            } => (*source_song_id, *match_level),
            Decision::Reject {
                source_song_id,
                reason,
                ..
            } => {
                tracing::info!(
                    user_id = %submission.user_id,
                    source_song_id = %source_song_id,
                    reason = reason.as_str(),
                    "Submission rejected"
                );
                self.events.emit_lossy(MidimeEvent::SubmissionRejected {
                    user_id: submission.user_id,
                    source_song_id: *source_song_id,
                    reason: reason.as_str().to_string(),
                    timestamp: Utc::now(),
                });
                return Ok(IngestOutcome::Rejected { decision });
            }
        };

        let pattern = pattern.with_source(submission.song_id, source_song_id);
        let pattern_id = pattern.pattern_id;
        let instrument = pattern.instrument_type;

        let inserted = match self.index.insert(pattern) {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::error!(%pattern_id, error = %e, "Index rejected admitted pattern");
                self.guard
                    .revoke(submission.user_id, source_song_id, &submission.section_label, pattern_id)
                    .await?;
                return Err(e.into());
            }
        };
        self.precomputer.note_insert(pattern_id, instrument, &inserted);

        if inserted.ann_stale {
            self.spawn_ann_refresh(instrument);
        }

        tracing::info!(
            %pattern_id,
            source_song_id = %source_song_id,
            instrument = %instrument,
            match_level = ?match_level,
            backend = %inserted.backend,
            "Pattern admitted"
        );
        self.events.emit_lossy(MidimeEvent::PatternAdmitted {
            pattern_id,
            source_song_id,
            instrument_type: instrument.to_string(),
            timestamp: Utc::now(),
        });

        Ok(IngestOutcome::Admitted {
            pattern_id,
            source_song_id,
            match_level,
            backend: inserted.backend,
        })
    }

    /// Extend the approximate graph off the async runtime
    fn spawn_ann_refresh(&self, instrument: InstrumentType) {
        let index = Arc::clone(&self.index);
        let refresh = tokio::task::spawn_blocking(move || index.refresh_ann(instrument));
        tokio::spawn(async move {
            match refresh.await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(instrument = %instrument, "Approximate refresh skipped"),
                Err(e) => tracing::error!(
                    instrument = %instrument,
                    error = %e,
                    "Approximate refresh task failed"
                ),
            }
        });
    }

    /// Grouped similar patterns for a stored pattern under a tier's policy
    pub async fn similar(&self, request: RankRequest, tier: Tier) -> Result<RankedResults, CorpusError> {
        let policy = self.policies.resolve(tier);
        let ranker = Arc::clone(&self.ranker);
        let results = tokio::task::spawn_blocking(move || ranker.rank(&request, &policy))
            .await
            .map_err(|e| CorpusError::Task(e.to_string()))??;
        Ok(results)
    }

    /// Raw top-k for an ad-hoc vector
    pub async fn query_vector(
        &self,
        vector: Vec<f32>,
        instrument: InstrumentType,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<QueryOutcome, CorpusError> {
        let index = Arc::clone(&self.index);
        let outcome = tokio::task::spawn_blocking(move || index.query(&vector, instrument, k, deadline))
            .await
            .map_err(|e| CorpusError::Task(e.to_string()))??;
        Ok(outcome)
    }

    /// Replace a pattern's quality score in the store and the index
    pub async fn update_quality(&self, pattern_id: Uuid, quality_score: f32) -> Result<(), CorpusError> {
        if !quality_score.is_finite() {
            return Err(CorpusError::InvalidUpload(format!(
                "quality score {} is not finite",
                quality_score
            )));
        }
        let pool = self.pool.clone();
        retry_on_lock("quality update", self.config.dedup.max_lock_wait_ms, || {
            let pool = pool.clone();
            async move { patterns::update_quality(&pool, pattern_id, quality_score).await }
        })
        .await?;
        self.index.update_quality(pattern_id, quality_score)?;
        Ok(())
    }

    /// Heuristic duplicate matches awaiting review
    pub async fn pending_reviews(&self) -> Result<Vec<reviews::DuplicateReview>, CorpusError> {
        Ok(reviews::list_pending(&self.pool).await?)
    }
}
