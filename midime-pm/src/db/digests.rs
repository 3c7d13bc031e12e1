//! Song digest persistence
//!
//! One row per distinct source recording. `file_hash` is UNIQUE so two
//! concurrent first ingestions of byte-identical files converge on a single
//! `source_song_id`.

use super::{parse_timestamp, parse_uuid};
use crate::services::acoustic_digest::AcousticDigest;
use chrono::{DateTime, Utc};
use midime_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Visibility of a source song's patterns to other users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacySetting {
    #[default]
    Private,
    Public,
}

impl fmt::Display for PrivacySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivacySetting::Private => f.write_str("private"),
            PrivacySetting::Public => f.write_str("public"),
        }
    }
}

impl FromStr for PrivacySetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(PrivacySetting::Private),
            "public" => Ok(PrivacySetting::Public),
            other => Err(Error::Internal(format!("Unknown privacy setting: {}", other))),
        }
    }
}

/// Stored identity of one source recording
#[derive(Debug, Clone, PartialEq)]
pub struct SongDigest {
    pub source_song_id: Uuid,
    pub acoustic_digest: AcousticDigest,
    pub file_hash: String,
    pub privacy_setting: PrivacySetting,
    /// Heuristic duplicate inputs, captured from the first ingestion
    pub tempo_bpm: f64,
    pub key_signature: String,
    pub duration_s: f64,
    pub created_at: DateTime<Utc>,
}

/// Insert a digest unless one with the same file hash exists
///
/// Returns the `source_song_id` stored for the hash, which is the caller's
/// id only if this insert won.
pub async fn insert_if_absent(pool: &SqlitePool, digest: &SongDigest) -> Result<Uuid> {
    sqlx::query(
        r#"
        INSERT INTO song_digests (
            source_song_id, acoustic_digest, file_hash, privacy_setting,
            tempo_bpm, key_signature, duration_s, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_hash) DO NOTHING
        "#,
    )
    .bind(digest.source_song_id.to_string())
    .bind(digest.acoustic_digest.encode())
    .bind(&digest.file_hash)
    .bind(digest.privacy_setting.to_string())
    .bind(digest.tempo_bpm)
    .bind(&digest.key_signature)
    .bind(digest.duration_s)
    .bind(digest.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    let stored: String =
        sqlx::query_scalar("SELECT source_song_id FROM song_digests WHERE file_hash = ?")
            .bind(&digest.file_hash)
            .fetch_one(pool)
            .await?;

    parse_uuid("song_digests.source_song_id", &stored)
}

/// Load every stored digest, oldest first
///
/// Rows whose digest cannot be decoded are skipped with a warning; they can
/// still match by file hash through the database constraint.
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<SongDigest>> {
    let rows = sqlx::query(
        r#"
        SELECT source_song_id, acoustic_digest, file_hash, privacy_setting,
               tempo_bpm, key_signature, duration_s, created_at
        FROM song_digests
        ORDER BY created_at ASC, source_song_id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut digests = Vec::with_capacity(rows.len());
    for row in rows {
        let id_str: String = row.get("source_song_id");
        let source_song_id = parse_uuid("song_digests.source_song_id", &id_str)?;

        let encoded: String = row.get("acoustic_digest");
        let acoustic_digest = match AcousticDigest::decode(&encoded) {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!(%source_song_id, error = %e, "Skipping undecodable song digest");
                continue;
            }
        };

        let privacy: String = row.get("privacy_setting");
        let created_at: String = row.get("created_at");

        digests.push(SongDigest {
            source_song_id,
            acoustic_digest,
            file_hash: row.get("file_hash"),
            privacy_setting: privacy.parse()?,
            tempo_bpm: row.get("tempo_bpm"),
            key_signature: row.get("key_signature"),
            duration_s: row.get("duration_s"),
            created_at: parse_timestamp("song_digests.created_at", &created_at)?,
        });
    }

    Ok(digests)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::init_tables;
    use midime_common::db::init_memory_database;

    pub(crate) fn sample_digest(file_hash: &str) -> SongDigest {
        SongDigest {
            source_song_id: Uuid::new_v4(),
            acoustic_digest: AcousticDigest::from_frames(vec![0xDEAD_BEEF; 64]),
            file_hash: file_hash.to_string(),
            privacy_setting: PrivacySetting::Private,
            tempo_bpm: 120.0,
            key_signature: "C major".to_string(),
            duration_s: 180.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();

        let digest = sample_digest("abc");
        let id = insert_if_absent(&pool, &digest).await.unwrap();
        assert_eq!(id, digest.source_song_id);

        let loaded = load_all(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].acoustic_digest, digest.acoustic_digest);
        assert_eq!(loaded[0].key_signature, "C major");
    }

    #[tokio::test]
    async fn test_conflicting_hash_returns_existing_id() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();

        let first = sample_digest("same");
        let second = sample_digest("same");
        let a = insert_if_absent(&pool, &first).await.unwrap();
        let b = insert_if_absent(&pool, &second).await.unwrap();

        assert_eq!(a, first.source_song_id);
        assert_eq!(b, first.source_song_id);
        assert_eq!(load_all(&pool).await.unwrap().len(), 1);
    }
}
