use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tideway_core::{
    error::{Result, TidewayError},
    traits::ContinuationStore,
    types::{PartitionId, ResumeToken, VersionTag},
};

use crate::store::{map_sqlite_err, SqliteStore};

#[async_trait]
impl ContinuationStore for SqliteStore {
    async fn load(&self, partition_id: &str) -> Result<Option<(ResumeToken, VersionTag)>> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT token, version FROM continuations WHERE partition_id = ?1",
                    [&partition_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(map_sqlite_err)?;

            Ok(row.map(|(token, version)| {
                (
                    ResumeToken::new(token as u64),
                    VersionTag::new(version as u64),
                )
            }))
        })
        .await
    }

    async fn store(
        &self,
        partition_id: &str,
        token: ResumeToken,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let (changed, version) = match expected {
                None => {
                    let version = VersionTag::INITIAL.next();
                    let changed = conn
                        .execute(
                            "INSERT OR IGNORE INTO continuations (partition_id, token, version)
                             VALUES (?1, ?2, ?3)",
                            params![partition_id, token.value() as i64, version.value() as i64],
                        )
                        .map_err(map_sqlite_err)?;
                    (changed, version)
                }
                Some(expected) => {
                    let version = expected.next();
                    let changed = conn
                        .execute(
                            "UPDATE continuations
                             SET token = ?1, version = ?2, updated_at = datetime('now')
                             WHERE partition_id = ?3 AND version = ?4",
                            params![
                                token.value() as i64,
                                version.value() as i64,
                                partition_id,
                                expected.value() as i64
                            ],
                        )
                        .map_err(map_sqlite_err)?;
                    (changed, version)
                }
            };

            if changed == 0 {
                return Err(TidewayError::PreconditionFailed(format!(
                    "continuation for partition {} changed concurrently",
                    partition_id
                )));
            }
            Ok(version)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(PartitionId, ResumeToken)>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT partition_id, token FROM continuations ORDER BY partition_id")
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let token: i64 = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, ResumeToken::new(token as u64)))
                })
                .map_err(map_sqlite_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)
        })
        .await
    }
}
