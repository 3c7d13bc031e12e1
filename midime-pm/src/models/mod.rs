//! Data models for the pattern matcher

pub mod neighbor;
pub mod pattern;
pub mod submission;
pub mod tier;

pub use neighbor::{Neighbor, NeighborList};
pub use pattern::{
    validate_fingerprint, Band, InstrumentType, Onset, Pattern, PatternError, PatternSummary,
    FINGERPRINT_DIMS,
};
pub use submission::{AnalyzedPattern, SourceFile, SourceIdentity, Submission};
pub use tier::{ResultCap, Tier, TierPolicies, TierPolicy};
