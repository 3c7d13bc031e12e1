//! Runtime configuration for midime-pm
//!
//! Loaded from the `[matcher]`-style TOML file `midime-pm.toml` next to the
//! shared config. Every field has a default so a missing file, or a file that
//! only overrides a couple of values, is valid.

use crate::models::tier::{TierPolicies, TierPolicy};
use midime_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Complete matcher configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub precompute: PrecomputeConfig,
    /// Tier policy overrides keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, TierPolicy>,
}

/// Pattern index thresholds and approximate-index parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Corpus size below which queries are brute-force
    pub brute_force_limit: usize,
    /// Corpus size at or above which the approximate index serves queries
    pub precomputed_limit: usize,
    /// Neighbor list length K
    pub neighbor_list_len: usize,
    pub ann_max_degree: usize,
    pub ann_ef_construction: usize,
    pub ann_ef_search: usize,
    /// Recall target; widens the search beam when raised
    pub ann_recall_target: f32,
    /// Unindexed inserts tolerated before the approximate graph is extended
    pub ann_rebuild_tail: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            brute_force_limit: 10_000,
            precomputed_limit: 100_000,
            neighbor_list_len: 50,
            ann_max_degree: 24,
            ann_ef_construction: 128,
            ann_ef_search: 96,
            ann_recall_target: 0.95,
            ann_rebuild_tail: 1_024,
        }
    }
}

/// Duplicate guard thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub digest_similarity_threshold: f32,
    pub tempo_tolerance_bpm: f64,
    pub duration_tolerance_s: f64,
    /// Enables the tempo/key/duration heuristic level
    pub heuristic_enabled: bool,
    /// Total time to retry a locked database write
    pub max_lock_wait_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            digest_similarity_threshold: 0.95,
            tempo_tolerance_bpm: 2.0,
            duration_tolerance_s: 1.5,
            heuristic_enabled: true,
            max_lock_wait_ms: 5_000,
        }
    }
}

/// Neighbor precomputation scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputeConfig {
    /// Inserts since the last run that schedule a new run
    pub insert_threshold: usize,
    /// Timer that schedules a run when inserts are pending
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        Self {
            insert_threshold: 256,
            interval_secs: 300,
            batch_size: 512,
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

impl PrecomputeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Backoff before retry `attempt` (1-based): base * 2^(attempt-1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl MatcherConfig {
    /// Parse from TOML text and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: MatcherConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Matcher config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded matcher config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.brute_force_limit > self.index.precomputed_limit {
            return Err(Error::Config(format!(
                "index.brute_force_limit ({}) exceeds index.precomputed_limit ({})",
                self.index.brute_force_limit, self.index.precomputed_limit
            )));
        }
        if self.index.neighbor_list_len == 0 {
            return Err(Error::Config("index.neighbor_list_len must be > 0".to_string()));
        }
        if self.index.ann_max_degree < 2 {
            return Err(Error::Config("index.ann_max_degree must be >= 2".to_string()));
        }
        if !(0.0..=1.0).contains(&self.dedup.digest_similarity_threshold) {
            return Err(Error::Config(
                "dedup.digest_similarity_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.precompute.batch_size == 0 || self.precompute.max_attempts == 0 {
            return Err(Error::Config(
                "precompute.batch_size and precompute.max_attempts must be > 0".to_string(),
            ));
        }
        self.tier_policies()?;
        Ok(())
    }

    pub fn tier_policies(&self) -> Result<TierPolicies> {
        TierPolicies::with_overrides(&self.tiers).map_err(Error::Config)
    }
}
