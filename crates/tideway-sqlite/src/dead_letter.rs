//! Dead letter table
//!
//! Stores batches that exhausted their dispatch attempts for later analysis
//! and replay.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tideway_core::{
    error::Result,
    traits::DeadLetterSink,
    types::{ChangeRecord, DeadLetter, ResumeToken},
};

use crate::store::{from_millis, map_sqlite_err, SqliteStore};

/// A dead letter together with its row id
#[derive(Debug, Clone)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub dead_letter: DeadLetter,
}

const SELECT_COLUMNS: &str = "SELECT id, partition_id, first_token, last_token, records, error, attempts, failed_at_ms
     FROM dead_letters";

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, DeadLetter, String)> {
    let first_token: Option<i64> = row.get(2)?;
    let last_token: Option<i64> = row.get(3)?;
    let records: String = row.get(4)?;
    let attempts: i64 = row.get(6)?;
    let failed_at_ms: i64 = row.get(7)?;
    let dead_letter = DeadLetter {
        partition_id: row.get(1)?,
        first_token: first_token.map(|t| ResumeToken::new(t as u64)),
        last_token: last_token.map(|t| ResumeToken::new(t as u64)),
        records: Vec::new(),
        error: row.get(5)?,
        attempts: attempts as u32,
        failed_at: from_millis(failed_at_ms),
    };
    Ok((row.get(0)?, dead_letter, records))
}

fn decode(row: (i64, DeadLetter, String)) -> Result<StoredDeadLetter> {
    let (id, mut dead_letter, records) = row;
    dead_letter.records = serde_json::from_str::<Vec<ChangeRecord>>(&records)?;
    Ok(StoredDeadLetter { id, dead_letter })
}

impl SqliteStore {
    /// Most recent dead letters first
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<StoredDeadLetter>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([limit as i64], row_to_stored)
                .map_err(map_sqlite_err)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(decode(row.map_err(map_sqlite_err)?)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_dead_letter(&self, id: i64) -> Result<Option<StoredDeadLetter>> {
        self.call(move |conn| {
            let row = conn
                .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), [id], row_to_stored)
                .optional()
                .map_err(map_sqlite_err)?;
            row.map(decode).transpose()
        })
        .await
    }

    pub async fn count_dead_letters(&self) -> Result<usize> {
        self.call(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
                .map_err(map_sqlite_err)?;
            Ok(count as usize)
        })
        .await
    }

    /// Remove one dead letter; returns whether it existed
    pub async fn remove_dead_letter(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let removed = conn
                .execute("DELETE FROM dead_letters WHERE id = ?1", [id])
                .map_err(map_sqlite_err)?;
            Ok(removed > 0)
        })
        .await
    }

    /// Remove every dead letter; returns how many were removed
    pub async fn clear_dead_letters(&self) -> Result<usize> {
        self.call(|conn| {
            conn.execute("DELETE FROM dead_letters", [])
                .map_err(map_sqlite_err)
        })
        .await
    }
}

#[async_trait]
impl DeadLetterSink for SqliteStore {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        let records = serde_json::to_string(&dead_letter.records)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO dead_letters
                 (partition_id, first_token, last_token, records, error, attempts, failed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dead_letter.partition_id,
                    dead_letter.first_token.map(|t| t.value() as i64),
                    dead_letter.last_token.map(|t| t.value() as i64),
                    records,
                    dead_letter.error,
                    dead_letter.attempts as i64,
                    dead_letter.failed_at.timestamp_millis(),
                ],
            )
            .map_err(map_sqlite_err)?;

            tracing::debug!(
                partition_id = %dead_letter.partition_id,
                id = conn.last_insert_rowid(),
                "Stored dead letter"
            );
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;
    use tideway_core::types::Batch;

    fn batch(partition: &str, tokens: std::ops::RangeInclusive<u64>) -> Batch {
        let records = tokens
            .map(|t| ChangeRecord::new(partition, ResumeToken::new(t), format!("r{}", t).into_bytes()))
            .collect();
        Batch::new(partition, records)
    }

    #[tokio::test]
    async fn test_send_and_get() {
        let (_dir, store) = open_temp();
        let dl = DeadLetter::from_batch(&batch("p0", 4..=6), "boom", 5);
        store.send(dl).await.unwrap();

        assert_eq!(store.count_dead_letters().await.unwrap(), 1);
        let listed = store.list_dead_letters(10).await.unwrap();
        let stored = store.get_dead_letter(listed[0].id).await.unwrap().unwrap();

        assert_eq!(stored.dead_letter.partition_id, "p0");
        assert_eq!(stored.dead_letter.first_token, Some(ResumeToken::new(4)));
        assert_eq!(stored.dead_letter.last_token, Some(ResumeToken::new(6)));
        assert_eq!(stored.dead_letter.attempts, 5);
        assert_eq!(stored.dead_letter.error, "boom");
        assert_eq!(stored.dead_letter.to_batch().len(), 3);
        assert_eq!(stored.dead_letter.records[2].payload, b"r6".to_vec());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (_dir, store) = open_temp();
        for p in ["p0", "p1", "p2"] {
            store.send(DeadLetter::from_batch(&batch(p, 1..=1), "bad", 3)).await.unwrap();
        }

        let newest = store.list_dead_letters(1).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].dead_letter.partition_id, "p2");

        assert!(store.remove_dead_letter(newest[0].id).await.unwrap());
        assert!(!store.remove_dead_letter(newest[0].id).await.unwrap());
        assert_eq!(store.clear_dead_letters().await.unwrap(), 2);
        assert_eq!(store.count_dead_letters().await.unwrap(), 0);
        assert!(store.get_dead_letter(1).await.unwrap().is_none());
    }
}
