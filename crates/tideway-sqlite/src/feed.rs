use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, TransactionBehavior};
use tideway_core::{
    error::Result,
    traits::{Appender, ChangeFeed},
    types::{Batch, ChangeRecord, FeedPage, PartitionId, ResumeToken},
};

use crate::store::{from_millis, map_sqlite_err, SqliteStore};

impl SqliteStore {
    /// Register a partition so it is discovered before its first record
    pub async fn create_partition(&self, partition_id: &str) -> Result<()> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO partitions (partition_id) VALUES (?1)",
                [&partition_id],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    /// Number of records stored for a partition
    pub async fn record_count(&self, partition_id: &str) -> Result<u64> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM change_feed WHERE partition_id = ?1",
                    [&partition_id],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)?;
            Ok(count as u64)
        })
        .await
    }
}

#[async_trait]
impl ChangeFeed for SqliteStore {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT partition_id FROM partitions ORDER BY partition_id")
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)
        })
        .await
    }

    async fn fetch_changes(
        &self,
        partition_id: &str,
        after: Option<ResumeToken>,
        max_items: usize,
    ) -> Result<FeedPage> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let after_value = after.map(|t| t.value() as i64).unwrap_or(0);
            let mut stmt = conn
                .prepare(
                    "SELECT token, payload, timestamp_ms FROM change_feed
                     WHERE partition_id = ?1 AND token > ?2
                     ORDER BY token ASC
                     LIMIT ?3",
                )
                .map_err(map_sqlite_err)?;

            let rows = stmt
                .query_map(params![partition_id, after_value, max_items as i64], |row| {
                    let token: i64 = row.get(0)?;
                    let payload: Vec<u8> = row.get(1)?;
                    let ts: i64 = row.get(2)?;
                    Ok((token, payload, ts))
                })
                .map_err(map_sqlite_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (token, payload, ts) = row.map_err(map_sqlite_err)?;
                records.push(ChangeRecord {
                    partition_id: partition_id.clone(),
                    token: ResumeToken::new(token as u64),
                    payload,
                    timestamp: from_millis(ts),
                });
            }

            Ok(FeedPage::new(Batch::new(partition_id, records), after))
        })
        .await
    }

    async fn latest_token(&self, partition_id: &str) -> Result<Option<ResumeToken>> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let max = conn
                .query_row(
                    "SELECT MAX(token) FROM change_feed WHERE partition_id = ?1",
                    [&partition_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map_err(map_sqlite_err)?;
            Ok(max.map(|t| ResumeToken::new(t as u64)))
        })
        .await
    }
}

#[async_trait]
impl Appender for SqliteStore {
    async fn append(&self, partition_id: &str, payload: &[u8]) -> Result<ResumeToken> {
        let partition_id = partition_id.to_string();
        let payload = payload.to_vec();
        self.call(move |conn| {
            // IMMEDIATE takes the write lock up front so two processes cannot
            // read the same MAX(token).
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;

            tx.execute(
                "INSERT OR IGNORE INTO partitions (partition_id) VALUES (?1)",
                [&partition_id],
            )
            .map_err(map_sqlite_err)?;

            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(token), 0) + 1 FROM change_feed WHERE partition_id = ?1",
                    [&partition_id],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)?;

            tx.execute(
                "INSERT INTO change_feed (partition_id, token, payload, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![partition_id, next, payload, Utc::now().timestamp_millis()],
            )
            .map_err(map_sqlite_err)?;

            tx.commit().map_err(map_sqlite_err)?;
            Ok(ResumeToken::new(next as u64))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;

    #[tokio::test]
    async fn test_append_assigns_monotonic_tokens() {
        let (_dir, store) = open_temp();

        let t1 = store.append("p0", b"a").await.unwrap();
        let t2 = store.append("p0", b"b").await.unwrap();
        let other = store.append("p1", b"c").await.unwrap();

        assert_eq!(t1, ResumeToken::new(1));
        assert_eq!(t2, ResumeToken::new(2));
        assert_eq!(other, ResumeToken::new(1));
        assert_eq!(store.latest_token("p0").await.unwrap(), Some(t2));
        assert_eq!(store.record_count("p0").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fetch_after_token_respects_limit() {
        let (_dir, store) = open_temp();
        for i in 0..5u8 {
            store.append("p0", &[i]).await.unwrap();
        }

        let page = store.fetch_changes("p0", Some(ResumeToken::new(1)), 2).await.unwrap();
        let tokens: Vec<u64> = page.batch.records.iter().map(|r| r.token.value()).collect();
        assert_eq!(tokens, vec![2, 3]);
        assert_eq!(page.continuation, Some(ResumeToken::new(3)));
        assert_eq!(page.batch.records[0].payload, vec![1]);

        let tail = store.fetch_changes("p0", Some(ResumeToken::new(5)), 10).await.unwrap();
        assert!(tail.batch.is_empty());
        assert_eq!(tail.continuation, Some(ResumeToken::new(5)));
    }

    #[tokio::test]
    async fn test_partitions_listed_before_first_record() {
        let (_dir, store) = open_temp();
        store.create_partition("p2").await.unwrap();
        store.append("p0", b"x").await.unwrap();
        store.create_partition("p0").await.unwrap();

        assert_eq!(store.list_partitions().await.unwrap(), vec!["p0", "p2"]);
        assert_eq!(store.latest_token("p2").await.unwrap(), None);
    }
}
