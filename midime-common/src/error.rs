//! Shared error type for the matcher crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Storage, filesystem and configuration failures
///
/// Component errors (`GuardError`, `IndexError`, ...) wrap this one when a
/// failure comes from below them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Root folder or database directory could not be created or read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A row addressed by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data that cannot be decoded, or a lost lock-retry budget
    #[error("Internal error: {0}")]
    Internal(String),
}
