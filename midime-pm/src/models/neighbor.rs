//! Precomputed neighbor lists

use crate::models::pattern::InstrumentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of a neighbor list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub pattern_id: Uuid,
    pub score: f32,
}

/// Ranked closest patterns of one pattern
///
/// Never contains the owning pattern and is ordered by score descending.
/// Rebuilt as a whole on every recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborList {
    pub pattern_id: Uuid,
    pub instrument_type: InstrumentType,
    pub neighbors: Vec<Neighbor>,
    pub computed_at: DateTime<Utc>,
}

impl NeighborList {
    /// Build a list, dropping self references and enforcing score order
    pub fn new(
        pattern_id: Uuid,
        instrument_type: InstrumentType,
        mut neighbors: Vec<Neighbor>,
        max_len: usize,
    ) -> Self {
        neighbors.retain(|n| n.pattern_id != pattern_id);
        neighbors.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        neighbors.truncate(max_len);
        Self {
            pattern_id,
            instrument_type,
            neighbors,
            computed_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}
