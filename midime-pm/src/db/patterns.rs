//! Pattern persistence

use super::{decode_vector, encode_vector, parse_timestamp, parse_uuid};
use crate::models::pattern::{InstrumentType, Pattern};
use midime_common::{Error, Result};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Insert one pattern row on a pool or inside an open transaction
pub async fn save_pattern<'e, E>(executor: E, pattern: &Pattern) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO patterns (
            pattern_id, song_id, source_song_id, instrument_type, fingerprint,
            tempo, key_signature, genre, section_label, quality_score, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(pattern.pattern_id.to_string())
    .bind(pattern.song_id.to_string())
    .bind(pattern.source_song_id.to_string())
    .bind(pattern.instrument_type.as_str())
    .bind(encode_vector(pattern.fingerprint()))
    .bind(pattern.tempo)
    .bind(&pattern.key_signature)
    .bind(&pattern.genre)
    .bind(&pattern.section_label)
    .bind(pattern.quality_score)
    .bind(pattern.created_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn delete_pattern(conn: &mut SqliteConnection, pattern_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM patterns WHERE pattern_id = ?")
        .bind(pattern_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Load every pattern in insertion order
///
/// Insertion order is what the in-memory index is rebuilt from, so positions
/// (and tie-breaks on them) survive a restart.
pub async fn load_patterns(pool: &SqlitePool) -> Result<Vec<Pattern>> {
    let rows = sqlx::query(
        r#"
        SELECT pattern_id, song_id, source_song_id, instrument_type, fingerprint,
               tempo, key_signature, genre, section_label, quality_score, created_at
        FROM patterns
        ORDER BY rowid ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut patterns = Vec::with_capacity(rows.len());
    for row in rows {
        let pattern_id: String = row.get("pattern_id");
        let song_id: String = row.get("song_id");
        let source_song_id: String = row.get("source_song_id");
        let instrument: String = row.get("instrument_type");
        let fingerprint: Vec<u8> = row.get("fingerprint");
        let created_at: String = row.get("created_at");

        let instrument_type: InstrumentType = instrument
            .parse()
            .map_err(|e| Error::Internal(format!("patterns.instrument_type: {}", e)))?;
        let vector = decode_vector(&fingerprint)?;

        let pattern = Pattern::new(instrument_type, vector)
            .map_err(|e| Error::Internal(format!("Stored pattern {}: {}", pattern_id, e)))?
            .with_id(parse_uuid("patterns.pattern_id", &pattern_id)?)
            .with_source(
                parse_uuid("patterns.song_id", &song_id)?,
                parse_uuid("patterns.source_song_id", &source_song_id)?,
            )
            .with_tempo(row.get("tempo"))
            .with_key(row.get::<String, _>("key_signature"))
            .with_genre(row.get::<String, _>("genre"))
            .with_section(row.get::<String, _>("section_label"))
            .with_quality(row.get("quality_score"))
            .with_created_at(parse_timestamp("patterns.created_at", &created_at)?);

        patterns.push(pattern);
    }

    Ok(patterns)
}

pub async fn update_quality(pool: &SqlitePool, pattern_id: Uuid, quality_score: f32) -> Result<()> {
    let result = sqlx::query("UPDATE patterns SET quality_score = ? WHERE pattern_id = ?")
        .bind(quality_score)
        .bind(pattern_id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Pattern {}", pattern_id)));
    }
    Ok(())
}
