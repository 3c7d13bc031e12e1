//! Duplicate guard
//!
//! Decides whether a submission may add a section to the corpus. Identity of
//! the source recording is resolved first, then the tier's section cap is
//! enforced for the submitting user.
//!
//! Identity levels, first match wins:
//! 1. File hash equal to a stored digest's hash
//! 2. Acoustic digest similarity at or above the configured threshold
//! 3. Tempo, key and duration heuristic (optional, logged for review); the
//!    stored recording nearest in tempo and duration wins
//!
//! Without a match a new `source_song_id` is minted.

use crate::config::DedupConfig;
use crate::db::{digests, ownership, patterns, reviews};
use crate::db::digests::{PrivacySetting, SongDigest};
use crate::models::pattern::Pattern;
use crate::models::tier::{Tier, TierPolicy};
use crate::services::acoustic_digest::AcousticDigest;
use crate::utils::{retry_on_lock, KeyedMutex};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Duplicate guard errors
///
/// Rejections are `Decision` values; these are infrastructure failures.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Duplicate guard storage error: {0}")]
    Storage(#[from] midime_common::Error),

    #[error("Invalid guard request: {0}")]
    InvalidRequest(String),

    #[error("Digest comparison task failed: {0}")]
    Task(String),
}

/// How the source recording was identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLevel {
    FileHash,
    AcousticDigest,
    Heuristic,
    /// No stored recording matched; a new source id was minted
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The user already submitted this section label for this source song
    DuplicateSection,
    /// The tier's max sections per song is reached
    TierLimitExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::DuplicateSection => "duplicate_section",
            RejectReason::TierLimitExceeded => "tier_limit_exceeded",
        }
    }
}

/// Guard outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        source_song_id: Uuid,
        match_level: MatchLevel,
    },
    Reject {
        source_song_id: Uuid,
        reason: RejectReason,
        existing_sections: Vec<String>,
    },
}

impl Decision {
    pub fn source_song_id(&self) -> Uuid {
        match self {
            Decision::Allow { source_song_id, .. } | Decision::Reject { source_song_id, .. } => {
                *source_song_id
            }
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// One admission check
#[derive(Debug, Clone)]
pub struct GuardRequest<'a> {
    pub acoustic_digest: &'a AcousticDigest,
    pub file_hash: &'a str,
    /// Whole-recording duration, tempo and key feed the heuristic level
    pub duration_s: f64,
    pub tempo_bpm: f64,
    pub detected_key: &'a str,
    pub source_song_id_candidate: Option<Uuid>,
    pub user_id: Uuid,
    pub tier: Tier,
    pub policy: &'a TierPolicy,
    pub section_label: &'a str,
    /// Written in the admission transaction, re-sourced to the resolved
    /// recording, so a section is never recorded without its pattern
    pub pattern: Option<&'a Pattern>,
}

/// Read-only view of the stored digests, replaced as a whole on mint
#[derive(Debug, Default)]
struct DigestCache {
    entries: Vec<Arc<SongDigest>>,
    by_hash: HashMap<String, Uuid>,
    ids: HashSet<Uuid>,
}

impl DigestCache {
    fn from_digests(digests: Vec<SongDigest>) -> Self {
        let mut cache = Self::default();
        for digest in digests {
            cache.push(Arc::new(digest));
        }
        cache
    }

    fn push(&mut self, digest: Arc<SongDigest>) {
        self.by_hash
            .insert(digest.file_hash.clone(), digest.source_song_id);
        self.ids.insert(digest.source_song_id);
        self.entries.push(digest);
    }

    fn with(&self, digest: SongDigest) -> Self {
        let mut next = Self {
            entries: self.entries.clone(),
            by_hash: self.by_hash.clone(),
            ids: self.ids.clone(),
        };
        next.push(Arc::new(digest));
        next
    }
}

#[derive(Debug, Clone)]
struct IdentityLookup {
    acoustic_digest: AcousticDigest,
    file_hash: String,
    duration_s: f64,
    tempo_bpm: f64,
    detected_key: String,
}

#[derive(Debug, Clone, PartialEq)]
struct IdentityMatch {
    source_song_id: Uuid,
    level: MatchLevel,
    /// Human-readable evidence for heuristic matches
    evidence: Option<String>,
}

/// Stateful admission gate
pub struct DuplicateGuard {
    pool: SqlitePool,
    config: DedupConfig,
    digests: ArcSwap<DigestCache>,
    /// Serializes minting so concurrent uploads of one recording converge
    mint_lock: Mutex<()>,
    section_locks: KeyedMutex<(Uuid, Uuid)>,
}

impl DuplicateGuard {
    /// Create a guard over the stored digests
    pub async fn load(pool: SqlitePool, config: DedupConfig) -> Result<Self, GuardError> {
        let stored = digests::load_all(&pool).await?;
        tracing::info!(digests = stored.len(), "Duplicate guard loaded song digests");

        Ok(Self {
            pool,
            config,
            digests: ArcSwap::from_pointee(DigestCache::from_digests(stored)),
            mint_lock: Mutex::new(()),
            section_locks: KeyedMutex::new(),
        })
    }

    /// Number of distinct source recordings known to the guard
    pub fn source_count(&self) -> usize {
        self.digests.load().entries.len()
    }

    /// Resolve the source recording and apply the tier's section cap
    ///
    /// **Algorithm:**
    /// 1. Resolve identity (hash, digest, heuristic), minting a new
    ///    `source_song_id` when nothing matches
    /// 2. Lock `(user_id, source_song_id)`
    /// 3. In one transaction: read the user's sections for the source, reject
    ///    a repeated label or a full cap, otherwise append the section and
    ///    save the request's pattern
    pub async fn check(&self, request: &GuardRequest<'_>) -> Result<Decision, GuardError> {
        if request.section_label.trim().is_empty() {
            return Err(GuardError::InvalidRequest("section label is empty".to_string()));
        }
        if request.file_hash.is_empty() {
            return Err(GuardError::InvalidRequest("file hash is empty".to_string()));
        }

        let identity = self.resolve_identity(request).await?;
        self.admit_section(request, identity.source_song_id, identity.level)
            .await
    }

    async fn resolve_identity(&self, request: &GuardRequest<'_>) -> Result<IdentityMatch, GuardError> {
        let lookup = IdentityLookup {
            acoustic_digest: request.acoustic_digest.clone(),
            file_hash: request.file_hash.to_string(),
            duration_s: request.duration_s,
            tempo_bpm: request.tempo_bpm,
            detected_key: request.detected_key.to_string(),
        };

        if let Some(found) = self.find_match(&lookup).await? {
            self.note_match(request, &found).await?;
            return Ok(found);
        }

        let _mint = self.mint_lock.lock().await;

        // Another ingestion may have minted this recording while we waited
        if let Some(found) = self.find_match(&lookup).await? {
            self.note_match(request, &found).await?;
            return Ok(found);
        }

        self.mint(request).await
    }

    async fn find_match(&self, lookup: &IdentityLookup) -> Result<Option<IdentityMatch>, GuardError> {
        let cache = self.digests.load_full();
        let lookup = lookup.clone();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || find_identity(&cache, &lookup, &config))
            .await
            .map_err(|e| GuardError::Task(e.to_string()))
    }

    async fn note_match(&self, request: &GuardRequest<'_>, found: &IdentityMatch) -> Result<(), GuardError> {
        tracing::debug!(
            source_song_id = %found.source_song_id,
            level = ?found.level,
            "Resolved existing source recording"
        );

        if found.level == MatchLevel::Heuristic {
            let evidence = found.evidence.as_deref().unwrap_or("heuristic match");
            tracing::warn!(
                source_song_id = %found.source_song_id,
                user_id = %request.user_id,
                file_hash = %request.file_hash,
                evidence,
                "Probable duplicate by heuristic, queued for review"
            );
            reviews::record_pending(
                &self.pool,
                found.source_song_id,
                request.user_id,
                request.file_hash,
                evidence,
            )
            .await?;
        }
        Ok(())
    }

    async fn mint(&self, request: &GuardRequest<'_>) -> Result<IdentityMatch, GuardError> {
        let current = self.digests.load_full();

        let proposed = match request.source_song_id_candidate {
            Some(candidate) if !current.ids.contains(&candidate) => candidate,
            Some(candidate) => {
                tracing::warn!(
                    %candidate,
                    "Candidate source_song_id already belongs to another recording, minting a new one"
                );
                Uuid::new_v4()
            }
            None => Uuid::new_v4(),
        };

        let record = SongDigest {
            source_song_id: proposed,
            acoustic_digest: request.acoustic_digest.clone(),
            file_hash: request.file_hash.to_string(),
            privacy_setting: PrivacySetting::default(),
            tempo_bpm: request.tempo_bpm,
            key_signature: request.detected_key.to_string(),
            duration_s: request.duration_s,
            created_at: Utc::now(),
        };

        let pool = self.pool.clone();
        let stored_id = retry_on_lock("song digest insert", self.config.max_lock_wait_ms, || {
            let pool = pool.clone();
            let record = record.clone();
            async move { digests::insert_if_absent(&pool, &record).await }
        })
        .await?;

        if stored_id != proposed {
            // Lost the conditional insert to a writer outside this guard
            tracing::info!(
                source_song_id = %stored_id,
                "Byte-identical recording already stored, reusing its source_song_id"
            );
            return Ok(IdentityMatch {
                source_song_id: stored_id,
                level: MatchLevel::FileHash,
                evidence: None,
            });
        }

        self.digests.store(Arc::new(current.with(record)));
        tracing::info!(source_song_id = %stored_id, "Minted new source recording");

        Ok(IdentityMatch {
            source_song_id: stored_id,
            level: MatchLevel::New,
            evidence: None,
        })
    }

    async fn admit_section(
        &self,
        request: &GuardRequest<'_>,
        source_song_id: Uuid,
        match_level: MatchLevel,
    ) -> Result<Decision, GuardError> {
        let user_id = request.user_id;
        let _key = self.section_locks.lock((user_id, source_song_id)).await;

        let pool = self.pool.clone();
        let tier = request.tier;
        let policy = request.policy.clone();
        let label = request.section_label.trim().to_string();
        let pattern = request
            .pattern
            .map(|p| p.clone().with_source(p.song_id, source_song_id));

        let decision = retry_on_lock("section admission", self.config.max_lock_wait_ms, || {
            let pool = pool.clone();
            let policy = policy.clone();
            let label = label.clone();
            let pattern = pattern.clone();
            async move {
                let mut tx = pool.begin().await?;
                let existing = ownership::sections_for(&mut *tx, user_id, source_song_id).await?;

                if existing.iter().any(|s| s == &label) {
                    return Ok(Decision::Reject {
                        source_song_id,
                        reason: RejectReason::DuplicateSection,
                        existing_sections: existing,
                    });
                }
                if !policy.allows_another_section(existing.len()) {
                    return Ok(Decision::Reject {
                        source_song_id,
                        reason: RejectReason::TierLimitExceeded,
                        existing_sections: existing,
                    });
                }

                ownership::append(&mut *tx, user_id, source_song_id, &label, tier).await?;
                if let Some(pattern) = &pattern {
                    patterns::save_pattern(&mut *tx, pattern).await?;
                }
                tx.commit().await?;

                Ok::<_, midime_common::Error>(Decision::Allow {
                    source_song_id,
                    match_level,
                })
            }
        })
        .await?;

        match &decision {
            Decision::Allow { .. } => tracing::info!(
                %user_id,
                %source_song_id,
                section = %label,
                level = ?match_level,
                "Section admitted"
            ),
            Decision::Reject {
                reason,
                existing_sections,
                ..
            } => tracing::info!(
                %user_id,
                %source_song_id,
                section = %label,
                reason = reason.as_str(),
                existing = existing_sections.len(),
                "Section rejected"
            ),
        }

        Ok(decision)
    }

    /// Remove an admitted section and its pattern row
    ///
    /// Used when a pattern was admitted but could not enter the index.
    pub async fn revoke(
        &self,
        user_id: Uuid,
        source_song_id: Uuid,
        section_label: &str,
        pattern_id: Uuid,
    ) -> Result<(), GuardError> {
        let _key = self.section_locks.lock((user_id, source_song_id)).await;
        let pool = self.pool.clone();
        let label = section_label.trim().to_string();

        retry_on_lock("admission revoke", self.config.max_lock_wait_ms, || {
            let pool = pool.clone();
            let label = label.clone();
            async move {
                let mut tx = pool.begin().await?;
                patterns::delete_pattern(&mut *tx, pattern_id).await?;
                ownership::remove(&mut *tx, user_id, source_song_id, &label).await?;
                tx.commit().await?;
                Ok::<_, midime_common::Error>(())
            }
        })
        .await?;

        tracing::warn!(
            %user_id,
            %source_song_id,
            %pattern_id,
            section = %label,
            "Admission revoked"
        );
        Ok(())
    }
}

/// Evaluate the identity levels against a cache snapshot
fn find_identity(
    cache: &DigestCache,
    lookup: &IdentityLookup,
    config: &DedupConfig,
) -> Option<IdentityMatch> {
    if let Some(id) = cache.by_hash.get(&lookup.file_hash) {
        return Some(IdentityMatch {
            source_song_id: *id,
            level: MatchLevel::FileHash,
            evidence: None,
        });
    }

    let mut best: Option<(Uuid, f32)> = None;
    for stored in &cache.entries {
        let similarity = stored.acoustic_digest.similarity(&lookup.acoustic_digest);
        if similarity >= config.digest_similarity_threshold
            && best.map_or(true, |(_, s)| similarity > s)
        {
            best = Some((stored.source_song_id, similarity));
        }
    }
    if let Some((id, similarity)) = best {
        tracing::debug!(source_song_id = %id, similarity, "Acoustic digest match");
        return Some(IdentityMatch {
            source_song_id: id,
            level: MatchLevel::AcousticDigest,
            evidence: None,
        });
    }

    if !config.heuristic_enabled || lookup.detected_key.trim().is_empty() {
        return None;
    }

    // Tempo and duration offsets as fractions of their tolerances
    let distance = |stored: &&Arc<SongDigest>| {
        (stored.tempo_bpm - lookup.tempo_bpm).abs() / config.tempo_tolerance_bpm.max(f64::EPSILON)
            + (stored.duration_s - lookup.duration_s).abs() / config.duration_tolerance_s.max(f64::EPSILON)
    };

    // Earliest stored recording wins a tie
    cache
        .entries
        .iter()
        .filter(|stored| {
            (stored.tempo_bpm - lookup.tempo_bpm).abs() <= config.tempo_tolerance_bpm
                && (stored.duration_s - lookup.duration_s).abs() <= config.duration_tolerance_s
                && stored
                    .key_signature
                    .trim()
                    .eq_ignore_ascii_case(lookup.detected_key.trim())
        })
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
        .map(|stored| IdentityMatch {
            source_song_id: stored.source_song_id,
            level: MatchLevel::Heuristic,
            evidence: Some(format!(
                "tempo {:.1}/{:.1} bpm, key {}, duration {:.1}/{:.1} s",
                stored.tempo_bpm,
                lookup.tempo_bpm,
                stored.key_signature,
                stored.duration_s,
                lookup.duration_s
            )),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_tables;
    use crate::models::pattern::{InstrumentType, FINGERPRINT_DIMS};
    use crate::services::acoustic_digest::tests::{test_signal, TEST_RATE};
    use crate::services::acoustic_digest::{acoustic_digest, DecodedAudio, HOP_SECONDS};
    use midime_common::db::init_memory_database;

    async fn guard_with(config: DedupConfig) -> (DuplicateGuard, SqlitePool) {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();
        let guard = DuplicateGuard::load(pool.clone(), config).await.unwrap();
        (guard, pool)
    }

    fn digest_of(samples: Vec<f32>) -> AcousticDigest {
        acoustic_digest(&DecodedAudio::new(samples, TEST_RATE)).unwrap()
    }

    fn request<'a>(
        digest: &'a AcousticDigest,
        file_hash: &'a str,
        user_id: Uuid,
        tier: Tier,
        policy: &'a TierPolicy,
        section_label: &'a str,
    ) -> GuardRequest<'a> {
        GuardRequest {
            acoustic_digest: digest,
            file_hash,
            duration_s: 8.0,
            tempo_bpm: 120.0,
            detected_key: "C major",
            source_song_id_candidate: None,
            user_id,
            tier,
            policy,
            section_label,
            pattern: None,
        }
    }

    #[tokio::test]
    async fn test_identical_hash_second_section_rejected_for_free_tier() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(10, 8.0));
        let free = TierPolicy::builtin(Tier::Free);
        let user = Uuid::new_v4();

        let first = guard
            .check(&request(&digest, "hash-a", user, Tier::Free, &free, "verse"))
            .await
            .unwrap();
        let source = match first {
            Decision::Allow {
                source_song_id,
                match_level,
            } => {
                assert_eq!(match_level, MatchLevel::New);
                source_song_id
            }
            other => panic!("expected allow, got {:?}", other),
        };

        let second = guard
            .check(&request(&digest, "hash-a", user, Tier::Free, &free, "chorus"))
            .await
            .unwrap();
        assert_eq!(
            second,
            Decision::Reject {
                source_song_id: source,
                reason: RejectReason::TierLimitExceeded,
                existing_sections: vec!["verse".to_string()],
            }
        );
        assert_eq!(guard.source_count(), 1);
    }

    #[tokio::test]
    async fn test_trimmed_recording_counts_against_cap() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let samples = test_signal(11, 8.0);
        let hop = (HOP_SECONDS * TEST_RATE as f64).round() as usize;
        let original = digest_of(samples.clone());
        let trimmed = digest_of(samples[hop * 8..].to_vec());
        let free = TierPolicy::builtin(Tier::Free);
        let user = Uuid::new_v4();

        let first = guard
            .check(&request(&original, "hash-orig", user, Tier::Free, &free, "verse"))
            .await
            .unwrap();
        let mut trimmed_request = request(&trimmed, "hash-trim", user, Tier::Free, &free, "bridge");
        trimmed_request.tempo_bpm = 95.0;
        let second = guard.check(&trimmed_request).await.unwrap();

        assert!(first.is_allowed());
        match second {
            Decision::Reject {
                source_song_id,
                reason,
                ..
            } => {
                assert_eq!(source_song_id, first.source_song_id());
                assert_eq!(reason, RejectReason::TierLimitExceeded);
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeated_section_label_is_rejected() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(12, 8.0));
        let pro = TierPolicy::builtin(Tier::Pro);
        let user = Uuid::new_v4();

        guard
            .check(&request(&digest, "h", user, Tier::Pro, &pro, "verse"))
            .await
            .unwrap();
        let again = guard
            .check(&request(&digest, "h", user, Tier::Pro, &pro, "verse"))
            .await
            .unwrap();
        assert!(matches!(
            again,
            Decision::Reject {
                reason: RejectReason::DuplicateSection,
                ..
            }
        ));

        // Other users are not affected by this user's sections
        let other = guard
            .check(&request(&digest, "h", Uuid::new_v4(), Tier::Pro, &pro, "verse"))
            .await
            .unwrap();
        assert!(other.is_allowed());
    }

    #[tokio::test]
    async fn test_heuristic_match_reuses_source_and_is_logged() {
        let (guard, pool) = guard_with(DedupConfig::default()).await;
        let a = digest_of(test_signal(13, 8.0));
        let b = digest_of(test_signal(14, 8.0));
        let pro = TierPolicy::builtin(Tier::Pro);
        let user = Uuid::new_v4();

        let first = guard
            .check(&request(&a, "ha", user, Tier::Pro, &pro, "intro"))
            .await
            .unwrap();
        let mut probable = request(&b, "hb", user, Tier::Pro, &pro, "outro");
        probable.tempo_bpm = 121.5;
        probable.duration_s = 9.0;
        let second = guard.check(&probable).await.unwrap();

        assert_eq!(
            second,
            Decision::Allow {
                source_song_id: first.source_song_id(),
                match_level: MatchLevel::Heuristic,
            }
        );
        let pending = reviews::list_pending(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_hash, "hb");
    }

    #[tokio::test]
    async fn test_heuristic_prefers_nearest_recording() {
        let no_heuristic = DedupConfig {
            heuristic_enabled: false,
            ..DedupConfig::default()
        };
        let (minting, pool) = guard_with(no_heuristic).await;
        let a = digest_of(test_signal(21, 8.0));
        let b = digest_of(test_signal(22, 8.0));
        let lookup = digest_of(test_signal(23, 8.0));
        let pro = TierPolicy::builtin(Tier::Pro);
        let user = Uuid::new_v4();

        let mut earlier = request(&a, "ha", user, Tier::Pro, &pro, "intro");
        earlier.tempo_bpm = 119.0;
        let earlier = minting.check(&earlier).await.unwrap();
        let mut nearer = request(&b, "hb", user, Tier::Pro, &pro, "intro");
        nearer.tempo_bpm = 121.0;
        let nearer = minting.check(&nearer).await.unwrap();
        assert_ne!(earlier.source_song_id(), nearer.source_song_id());

        // Both stored recordings are within tolerance; the closer tempo wins
        let guard = DuplicateGuard::load(pool, DedupConfig::default()).await.unwrap();
        let mut probable = request(&lookup, "hp", user, Tier::Pro, &pro, "outro");
        probable.tempo_bpm = 120.6;
        let decision = guard.check(&probable).await.unwrap();
        assert_eq!(
            decision,
            Decision::Allow {
                source_song_id: nearer.source_song_id(),
                match_level: MatchLevel::Heuristic,
            }
        );
    }

    #[tokio::test]
    async fn test_pattern_saved_with_admitted_section() {
        let (guard, pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(24, 8.0));
        let free = TierPolicy::builtin(Tier::Free);
        let pattern = Pattern::new(InstrumentType::Drums, vec![0.5; FINGERPRINT_DIMS])
            .unwrap()
            .with_source(Uuid::new_v4(), Uuid::nil())
            .with_section("verse");

        let mut req = request(&digest, "hs", Uuid::new_v4(), Tier::Free, &free, "verse");
        req.pattern = Some(&pattern);
        let decision = guard.check(&req).await.unwrap();

        let stored = patterns::load_patterns(&pool).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pattern_id, pattern.pattern_id);
        assert_eq!(stored[0].source_song_id, decision.source_song_id());
    }

    #[tokio::test]
    async fn test_failed_pattern_write_keeps_section_free() {
        let config = DedupConfig {
            heuristic_enabled: false,
            ..DedupConfig::default()
        };
        let (guard, pool) = guard_with(config).await;
        let first_digest = digest_of(test_signal(25, 8.0));
        let second_digest = digest_of(test_signal(26, 8.0));
        let free = TierPolicy::builtin(Tier::Free);
        let user = Uuid::new_v4();
        let pattern = Pattern::new(InstrumentType::Bass, vec![0.25; FINGERPRINT_DIMS])
            .unwrap()
            .with_source(Uuid::new_v4(), Uuid::nil());

        let mut first = request(&first_digest, "h1", user, Tier::Free, &free, "verse");
        first.pattern = Some(&pattern);
        assert!(guard.check(&first).await.unwrap().is_allowed());

        // Reusing the stored pattern id makes the pattern insert fail
        let mut clashing = request(&second_digest, "h2", user, Tier::Free, &free, "verse");
        clashing.pattern = Some(&pattern);
        let err = guard.check(&clashing).await.unwrap_err();
        assert!(matches!(err, GuardError::Storage(_)));

        let fresh = Pattern::new(InstrumentType::Bass, vec![0.75; FINGERPRINT_DIMS])
            .unwrap()
            .with_source(Uuid::new_v4(), Uuid::nil());
        let mut retry = request(&second_digest, "h2", user, Tier::Free, &free, "verse");
        retry.pattern = Some(&fresh);
        let decision = guard.check(&retry).await.unwrap();
        assert!(decision.is_allowed(), "section slot leaked: {:?}", decision);
        assert_eq!(patterns::load_patterns(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_frees_section() {
        let (guard, pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(27, 8.0));
        let free = TierPolicy::builtin(Tier::Free);
        let user = Uuid::new_v4();
        let pattern = Pattern::new(InstrumentType::Melody, vec![0.5; FINGERPRINT_DIMS])
            .unwrap()
            .with_source(Uuid::new_v4(), Uuid::nil());

        let mut req = request(&digest, "hr", user, Tier::Free, &free, "hook");
        req.pattern = Some(&pattern);
        let source = guard.check(&req).await.unwrap().source_song_id();

        guard.revoke(user, source, "hook", pattern.pattern_id).await.unwrap();
        assert!(patterns::load_patterns(&pool).await.unwrap().is_empty());

        let again = guard
            .check(&request(&digest, "hr", user, Tier::Free, &free, "hook"))
            .await
            .unwrap();
        assert!(again.is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_heuristic_mints_new_source() {
        let config = DedupConfig {
            heuristic_enabled: false,
            ..DedupConfig::default()
        };
        let (guard, _pool) = guard_with(config).await;
        let a = digest_of(test_signal(15, 8.0));
        let b = digest_of(test_signal(16, 8.0));
        let pro = TierPolicy::builtin(Tier::Pro);
        let user = Uuid::new_v4();

        let first = guard
            .check(&request(&a, "ha", user, Tier::Pro, &pro, "intro"))
            .await
            .unwrap();
        let second = guard
            .check(&request(&b, "hb", user, Tier::Pro, &pro, "intro"))
            .await
            .unwrap();

        assert_ne!(first.source_song_id(), second.source_song_id());
        assert_eq!(guard.source_count(), 2);
    }

    #[tokio::test]
    async fn test_candidate_id_used_for_new_source() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(17, 8.0));
        let creator = TierPolicy::builtin(Tier::Creator);
        let candidate = Uuid::new_v4();

        let mut req = request(&digest, "hc", Uuid::new_v4(), Tier::Creator, &creator, "drop");
        req.source_song_id_candidate = Some(candidate);
        let decision = guard.check(&req).await.unwrap();
        assert_eq!(decision.source_song_id(), candidate);
    }

    #[tokio::test]
    async fn test_reload_restores_identity() {
        let (guard, pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(18, 8.0));
        let pro = TierPolicy::builtin(Tier::Pro);
        let first = guard
            .check(&request(&digest, "persisted", Uuid::new_v4(), Tier::Pro, &pro, "a"))
            .await
            .unwrap();

        let reloaded = DuplicateGuard::load(pool, DedupConfig::default()).await.unwrap();
        let again = reloaded
            .check(&request(&digest, "persisted", Uuid::new_v4(), Tier::Pro, &pro, "a"))
            .await
            .unwrap();
        assert_eq!(
            again,
            Decision::Allow {
                source_song_id: first.source_song_id(),
                match_level: MatchLevel::FileHash,
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_submissions_never_exceed_cap() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let guard = Arc::new(guard);
        let digest = Arc::new(digest_of(test_signal(19, 8.0)));
        let user = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..8 {
            let guard = Arc::clone(&guard);
            let digest = Arc::clone(&digest);
            handles.push(tokio::spawn(async move {
                let creator = TierPolicy::builtin(Tier::Creator);
                let label = format!("section-{}", i);
                guard
                    .check(&request(&digest, "same-file", user, Tier::Creator, &creator, &label))
                    .await
                    .unwrap()
            }));
        }

        let mut allowed = 0;
        let mut sources = HashSet::new();
        for handle in handles {
            let decision = handle.await.unwrap();
            sources.insert(decision.source_song_id());
            if decision.is_allowed() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_label_is_invalid() {
        let (guard, _pool) = guard_with(DedupConfig::default()).await;
        let digest = digest_of(test_signal(20, 8.0));
        let free = TierPolicy::builtin(Tier::Free);
        let err = guard
            .check(&request(&digest, "h", Uuid::new_v4(), Tier::Free, &free, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidRequest(_)));
    }

    #[test]
    fn test_decision_serializes_with_tag() {
        let decision = Decision::Reject {
            source_song_id: Uuid::nil(),
            reason: RejectReason::TierLimitExceeded,
            existing_sections: vec!["verse".to_string()],
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision"], "reject");
        assert_eq!(json["reason"], "tier_limit_exceeded");
        assert_eq!(json["existing_sections"][0], "verse");
    }
}
