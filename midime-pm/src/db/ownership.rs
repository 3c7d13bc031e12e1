//! Section ownership ledger
//!
//! Record of which (user, source song, section) combinations exist. Rows are
//! only removed when the admission that added them fails to complete.
//! Functions take a connection so the duplicate guard can run the
//! count-then-append inside one transaction.

use crate::models::tier::Tier;
use chrono::Utc;
use midime_common::Result;
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Section labels a user already owns for a source song, oldest first
pub async fn sections_for(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    source_song_id: Uuid,
) -> Result<Vec<String>> {
    let labels: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT section_label
        FROM section_ownership
        WHERE user_id = ? AND source_song_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(user_id.to_string())
    .bind(source_song_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    Ok(labels)
}

pub async fn append(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    source_song_id: Uuid,
    section_label: &str,
    tier: Tier,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO section_ownership (source_song_id, user_id, section_label, tier_at_time, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_song_id.to_string())
    .bind(user_id.to_string())
    .bind(section_label)
    .bind(tier.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Drop one section record, undoing an admission that could not complete
pub async fn remove(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    source_song_id: Uuid,
    section_label: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM section_ownership
        WHERE user_id = ? AND source_song_id = ? AND section_label = ?
        "#,
    )
    .bind(user_id.to_string())
    .bind(source_song_id.to_string())
    .bind(section_label)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::digests::{insert_if_absent, tests::sample_digest};
    use crate::db::init_tables;
    use midime_common::db::init_memory_database;

    #[tokio::test]
    async fn test_append_and_list() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();
        let source = insert_if_absent(&pool, &sample_digest("h")).await.unwrap();
        let user = Uuid::new_v4();

        let mut conn = pool.acquire().await.unwrap();
        append(&mut conn, user, source, "verse", Tier::Creator).await.unwrap();
        append(&mut conn, user, source, "chorus", Tier::Creator).await.unwrap();

        let sections = sections_for(&mut conn, user, source).await.unwrap();
        assert_eq!(sections, vec!["verse".to_string(), "chorus".to_string()]);
        assert!(sections_for(&mut conn, Uuid::new_v4(), source).await.unwrap().is_empty());

        assert!(remove(&mut conn, user, source, "verse").await.unwrap());
        let sections = sections_for(&mut conn, user, source).await.unwrap();
        assert_eq!(sections, vec!["chorus".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_section_violates_constraint() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();
        let source = insert_if_absent(&pool, &sample_digest("h")).await.unwrap();
        let user = Uuid::new_v4();

        let mut conn = pool.acquire().await.unwrap();
        append(&mut conn, user, source, "verse", Tier::Pro).await.unwrap();
        assert!(append(&mut conn, user, source, "verse", Tier::Pro).await.is_err());
    }
}
