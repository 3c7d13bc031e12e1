//! midime-pm library interface
//!
//! Pattern matcher core: fingerprints, source deduplication, the per-instrument
//! similarity index and grouped ranking. Exposed for the binary and for
//! integration tests.

pub mod config;
pub mod corpus;
pub mod db;
pub mod index;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::MatcherConfig;
pub use crate::corpus::{Corpus, CorpusError, IngestOutcome};
