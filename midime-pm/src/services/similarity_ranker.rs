//! Similarity ranker
//!
//! Turns raw index neighbors into the grouped, tier-capped result set shown
//! to users. One group per source song; the best-scoring section represents
//! the group and its siblings are listed under it.

use crate::index::{IndexError, PatternIndex, ScoredPattern};
use crate::models::pattern::Pattern;
use crate::models::tier::TierPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Raw neighbors fetched per requested group, to absorb filtering losses
const OVERFETCH_FACTOR: usize = 3;

#[derive(Debug, Error)]
pub enum RankError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Invalid rank request: {0}")]
    InvalidRequest(String),
}

/// Metadata filters; `None` means no constraint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankFilters {
    /// Inclusive tempo range in BPM
    pub tempo_range: Option<(f32, f32)>,
    pub genre_set: Option<HashSet<String>>,
    pub key_set: Option<HashSet<String>>,
}

impl RankFilters {
    pub fn matches(&self, pattern: &Pattern) -> bool {
        if let Some((low, high)) = self.tempo_range {
            if pattern.tempo < low || pattern.tempo > high {
                return false;
            }
        }
        if let Some(genres) = &self.genre_set {
            if !genres.contains(&pattern.genre) {
                return false;
            }
        }
        if let Some(keys) = &self.key_set {
            if !keys.contains(&pattern.key_signature) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct RankRequest {
    pub query_pattern_id: Uuid,
    pub filters: RankFilters,
    pub min_similarity: f32,
    pub limit: usize,
    pub deadline: Option<Instant>,
}

impl RankRequest {
    pub fn new(query_pattern_id: Uuid, limit: usize) -> Self {
        Self {
            query_pattern_id,
            filters: RankFilters::default(),
            min_similarity: 0.0,
            limit,
            deadline: None,
        }
    }
}

/// One section in a result group
///
/// Preview tiers see only `score_bucket`; full tiers see `pattern_id` and
/// `similarity_score`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_bucket: Option<u8>,
    pub tempo: f32,
    pub key: String,
    pub genre: String,
    pub section_label: String,
    pub upload_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultGroup {
    pub source_song_id: Uuid,
    /// Representative first
    pub sections: Vec<RankedSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResults {
    pub groups: Vec<ResultGroup>,
    /// Patterns that passed filters and the similarity floor, before capping
    pub total_matches: usize,
    pub partial: bool,
}

/// Score bucket shown to preview tiers: floor(score * 10) * 10, in [0, 100]
pub fn score_bucket(score: f32) -> u8 {
    ((score.clamp(0.0, 1.0) * 10.0).floor() * 10.0) as u8
}

/// Result order: score desc, quality desc, created_at asc, pattern_id asc
fn rank_order(a: &ScoredPattern, b: &ScoredPattern) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.pattern.quality_score.total_cmp(&a.pattern.quality_score))
        .then_with(|| a.pattern.created_at.cmp(&b.pattern.created_at))
        .then_with(|| a.pattern.pattern_id.cmp(&b.pattern.pattern_id))
}

pub struct SimilarityRanker {
    index: Arc<PatternIndex>,
}

impl SimilarityRanker {
    pub fn new(index: Arc<PatternIndex>) -> Self {
        Self { index }
    }

    /// Rank the corpus against a stored pattern
    ///
    /// **Algorithm:**
    /// 1. Fetch 3 x limit raw neighbors (query pattern excluded)
    /// 2. Apply tempo, genre and key filters, then the similarity floor
    /// 3. Group by source song, best section first
    /// 4. Order groups by their representative and truncate to the tier cap
    pub fn rank(&self, request: &RankRequest, policy: &TierPolicy) -> Result<RankedResults, RankError> {
        if request.limit == 0 {
            return Err(RankError::InvalidRequest("limit must be > 0".to_string()));
        }
        if !(-1.0..=1.0).contains(&request.min_similarity) {
            return Err(RankError::InvalidRequest(format!(
                "min_similarity {} outside [-1, 1]",
                request.min_similarity
            )));
        }

        let limit = match policy.result_cap.max_groups() {
            Some(cap) => request.limit.min(cap),
            None => request.limit,
        };
        let fetch = limit.saturating_mul(OVERFETCH_FACTOR);

        let outcome = self
            .index
            .query_pattern(request.query_pattern_id, fetch, request.deadline)?;
        let fetched = outcome.hits.len();

        let mut matches: Vec<ScoredPattern> = outcome
            .hits
            .into_iter()
            .filter(|hit| hit.pattern_id() != request.query_pattern_id)
            .filter(|hit| request.filters.matches(&hit.pattern))
            .filter(|hit| hit.score >= request.min_similarity)
            .collect();
        let total_matches = matches.len();

        matches.sort_by(rank_order);

        // Sorted input makes each group's first member its representative and
        // first-seen order the group order
        let mut order: Vec<Uuid> = Vec::new();
        let mut grouped: HashMap<Uuid, Vec<ScoredPattern>> = HashMap::new();
        for hit in matches {
            let source = hit.pattern.source_song_id;
            grouped
                .entry(source)
                .or_insert_with(|| {
                    order.push(source);
                    Vec::new()
                })
                .push(hit);
        }

        let preview = policy.result_cap.is_preview();
        let groups: Vec<ResultGroup> = order
            .into_iter()
            .take(limit)
            .filter_map(|source| {
                grouped.remove(&source).map(|hits| ResultGroup {
                    source_song_id: source,
                    sections: hits.iter().map(|hit| to_section(hit, preview)).collect(),
                })
            })
            .collect();

        tracing::debug!(
            query_pattern_id = %request.query_pattern_id,
            source = ?outcome.source,
            fetched,
            total_matches,
            groups = groups.len(),
            partial = outcome.partial,
            "Ranked similar patterns"
        );

        Ok(RankedResults {
            groups,
            total_matches,
            partial: outcome.partial,
        })
    }
}

fn to_section(hit: &ScoredPattern, preview: bool) -> RankedSection {
    let pattern = &hit.pattern;
    let (pattern_id, similarity_score, bucket) = if preview {
        (None, None, Some(score_bucket(hit.score)))
    } else {
        (Some(pattern.pattern_id), Some(hit.score), None)
    };
    RankedSection {
        pattern_id,
        similarity_score,
        score_bucket: bucket,
        tempo: pattern.tempo,
        key: pattern.key_signature.clone(),
        genre: pattern.genre.clone(),
        section_label: pattern.section_label.clone(),
        upload_date: pattern.created_at,
    }
}
