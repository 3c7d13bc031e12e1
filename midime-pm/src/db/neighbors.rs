//! Neighbor list persistence
//!
//! Each list is a single row replaced as a whole, so a reader or a crash
//! never sees a partially written list.

use super::{parse_timestamp, parse_uuid};
use crate::models::neighbor::{Neighbor, NeighborList};
use crate::models::pattern::InstrumentType;
use midime_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Replace the stored lists in one transaction
pub async fn replace_lists(pool: &SqlitePool, lists: &[NeighborList]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for list in lists {
        let neighbors = serde_json::to_string(&list.neighbors)
            .map_err(|e| Error::Internal(format!("Serialize neighbor list: {}", e)))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO neighbor_lists (pattern_id, instrument_type, neighbors, computed_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(list.pattern_id.to_string())
        .bind(list.instrument_type.as_str())
        .bind(neighbors)
        .bind(list.computed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn load_lists(pool: &SqlitePool, instrument_type: InstrumentType) -> Result<Vec<NeighborList>> {
    let rows = sqlx::query(
        r#"
        SELECT pattern_id, neighbors, computed_at
        FROM neighbor_lists
        WHERE instrument_type = ?
        "#,
    )
    .bind(instrument_type.as_str())
    .fetch_all(pool)
    .await?;

    let mut lists = Vec::with_capacity(rows.len());
    for row in rows {
        let pattern_id: String = row.get("pattern_id");
        let neighbors: String = row.get("neighbors");
        let computed_at: String = row.get("computed_at");

        let neighbors: Vec<Neighbor> = serde_json::from_str(&neighbors)
            .map_err(|e| Error::Internal(format!("neighbor_lists.neighbors: {}", e)))?;

        lists.push(NeighborList {
            pattern_id: parse_uuid("neighbor_lists.pattern_id", &pattern_id)?,
            instrument_type,
            neighbors,
            computed_at: parse_timestamp("neighbor_lists.computed_at", &computed_at)?,
        });
    }

    Ok(lists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_tables;
    use midime_common::db::init_memory_database;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_replace_overwrites_whole_list() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();

        let owner = Uuid::new_v4();
        let first = NeighborList::new(
            owner,
            InstrumentType::Drums,
            vec![
                Neighbor { pattern_id: Uuid::new_v4(), score: 0.9 },
                Neighbor { pattern_id: Uuid::new_v4(), score: 0.8 },
            ],
            50,
        );
        replace_lists(&pool, &[first]).await.unwrap();

        let replacement = NeighborList::new(
            owner,
            InstrumentType::Drums,
            vec![Neighbor { pattern_id: Uuid::new_v4(), score: 0.7 }],
            50,
        );
        replace_lists(&pool, std::slice::from_ref(&replacement)).await.unwrap();

        let loaded = load_lists(&pool, InstrumentType::Drums).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].neighbors, replacement.neighbors);
        assert!(load_lists(&pool, InstrumentType::Bass).await.unwrap().is_empty());
    }
}
