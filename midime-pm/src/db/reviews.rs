//! Review log for heuristic duplicate matches
//!
//! A tempo/key/duration match reuses an existing `source_song_id` but may be
//! a false positive. Each such match is logged here as `pending` so an
//! operator can inspect it.

use super::{parse_timestamp, parse_uuid};
use chrono::{DateTime, Utc};
use midime_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateReview {
    pub source_song_id: Uuid,
    pub user_id: Uuid,
    /// Hash of the upload that matched heuristically
    pub file_hash: String,
    pub match_reason: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

pub async fn record_pending(
    pool: &SqlitePool,
    source_song_id: Uuid,
    user_id: Uuid,
    file_hash: &str,
    match_reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO duplicate_reviews (source_song_id, user_id, file_hash, match_reason, status, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(source_song_id.to_string())
    .bind(user_id.to_string())
    .bind(file_hash)
    .bind(match_reason)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_pending(pool: &SqlitePool) -> Result<Vec<DuplicateReview>> {
    let rows = sqlx::query(
        r#"
        SELECT source_song_id, user_id, file_hash, match_reason, status, created_at
        FROM duplicate_reviews
        WHERE status = 'pending'
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let source: String = row.get("source_song_id");
            let user: String = row.get("user_id");
            let created_at: String = row.get("created_at");
            Ok(DuplicateReview {
                source_song_id: parse_uuid("duplicate_reviews.source_song_id", &source)?,
                user_id: parse_uuid("duplicate_reviews.user_id", &user)?,
                file_hash: row.get("file_hash"),
                match_reason: row.get("match_reason"),
                status: row.get("status"),
                created_at: parse_timestamp("duplicate_reviews.created_at", &created_at)?,
            })
        })
        .collect()
}
