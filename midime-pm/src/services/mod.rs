//! Matcher components
//!
//! Stateless builders (fingerprint, acoustic digest) and the stateful
//! services wired together by `Corpus`.

pub mod acoustic_digest;
pub mod duplicate_guard;
pub mod fingerprint_builder;
pub mod neighbor_precomputer;
pub mod similarity_ranker;

pub use acoustic_digest::{AcousticDigest, DecodedAudio, DigestError, SourceDigest};
pub use duplicate_guard::{Decision, DuplicateGuard, GuardError, GuardRequest, MatchLevel, RejectReason};
pub use fingerprint_builder::{FingerprintBuilder, FingerprintError};
pub use neighbor_precomputer::{NeighborPrecomputer, PrecomputeError, PrecomputeState, RunReport};
pub use similarity_ranker::{
    RankError, RankFilters, RankRequest, RankedResults, RankedSection, ResultGroup, SimilarityRanker,
};
