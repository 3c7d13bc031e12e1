//! Database access for midime-pm
//!
//! Tables live in the shared `midime.db` opened by `midime_common::db`.
//! UUIDs are stored as TEXT, timestamps as RFC 3339 TEXT, fingerprints as
//! little-endian f32 BLOBs and neighbor lists as JSON TEXT.

pub mod digests;
pub mod neighbors;
pub mod ownership;
pub mod patterns;
pub mod reviews;

use chrono::{DateTime, Utc};
use midime_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Create midime-pm tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS song_digests (
            source_song_id TEXT PRIMARY KEY,
            acoustic_digest TEXT NOT NULL,
            file_hash TEXT NOT NULL UNIQUE,
            privacy_setting TEXT NOT NULL DEFAULT 'private',
            tempo_bpm REAL NOT NULL,
            key_signature TEXT NOT NULL,
            duration_s REAL NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patterns (
            pattern_id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL,
            source_song_id TEXT NOT NULL REFERENCES song_digests(source_song_id),
            instrument_type TEXT NOT NULL,
            fingerprint BLOB NOT NULL,
            tempo REAL NOT NULL,
            key_signature TEXT NOT NULL,
            genre TEXT NOT NULL,
            section_label TEXT NOT NULL,
            quality_score REAL NOT NULL DEFAULT 0.0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_patterns_instrument ON patterns(instrument_type, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS section_ownership (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_song_id TEXT NOT NULL REFERENCES song_digests(source_song_id),
            user_id TEXT NOT NULL,
            section_label TEXT NOT NULL,
            tier_at_time TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(user_id, source_song_id, section_label)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS neighbor_lists (
            pattern_id TEXT PRIMARY KEY,
            instrument_type TEXT NOT NULL,
            neighbors TEXT NOT NULL DEFAULT '[]',
            computed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duplicate_reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_song_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            match_reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (song_digests, patterns, section_ownership, neighbor_lists, duplicate_reviews)"
    );

    Ok(())
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Invalid UUID in {}: {} ({})", column, value, e)))
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp in {}: {} ({})", column, value, e)))
}

/// Encode a vector as little-endian f32 bytes (bit-exact round trip)
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Internal(format!(
            "Fingerprint blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
