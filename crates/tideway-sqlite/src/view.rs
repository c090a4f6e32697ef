use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tideway_core::{
    error::{Result, TidewayError},
    traits::ViewStore,
    types::{AggregateView, VersionTag},
};

use crate::store::{map_sqlite_err, SqliteStore};

fn row_to_view(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggregateView> {
    let count: i64 = row.get(1)?;
    let version: i64 = row.get(3)?;
    Ok(AggregateView {
        key: row.get(0)?,
        count: count as u64,
        total: row.get(2)?,
        version_tag: Some(VersionTag::new(version as u64)),
    })
}

#[async_trait]
impl ViewStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<AggregateView>> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT key, count, total, version FROM views WHERE key = ?1",
                [&key],
                row_to_view,
            )
            .optional()
            .map_err(map_sqlite_err)
        })
        .await
    }

    async fn write(&self, view: &AggregateView, expected: Option<VersionTag>) -> Result<VersionTag> {
        let view = view.clone();
        self.call(move |conn| {
            let (changed, version) = match expected {
                None => {
                    let version = VersionTag::INITIAL.next();
                    let changed = conn
                        .execute(
                            "INSERT OR IGNORE INTO views (key, count, total, version)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![view.key, view.count as i64, view.total, version.value() as i64],
                        )
                        .map_err(map_sqlite_err)?;
                    (changed, version)
                }
                Some(expected) => {
                    let version = expected.next();
                    let changed = conn
                        .execute(
                            "UPDATE views
                             SET count = ?1, total = ?2, version = ?3, updated_at = datetime('now')
                             WHERE key = ?4 AND version = ?5",
                            params![
                                view.count as i64,
                                view.total,
                                version.value() as i64,
                                view.key,
                                expected.value() as i64
                            ],
                        )
                        .map_err(map_sqlite_err)?;
                    (changed, version)
                }
            };

            if changed == 0 {
                return Err(TidewayError::PreconditionFailed(format!("view {}", view.key)));
            }
            Ok(version)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<AggregateView>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, count, total, version FROM views ORDER BY key")
                .map_err(map_sqlite_err)?;
            let rows = stmt.query_map([], row_to_view).map_err(map_sqlite_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;

    #[tokio::test]
    async fn test_create_then_conditional_write() {
        let (_dir, store) = open_temp();
        assert!(store.read("CA").await.unwrap().is_none());

        let view = AggregateView::empty("CA").with_delta(tideway_core::Delta::new(1, 10.0));
        let v1 = store.write(&view, None).await.unwrap();

        let read = store.read("CA").await.unwrap().unwrap();
        assert_eq!(read.count, 1);
        assert_eq!(read.version_tag, Some(v1));

        let bumped = read.with_delta(tideway_core::Delta::new(2, 5.5));
        let v2 = store.write(&bumped, Some(v1)).await.unwrap();
        assert_eq!(v2, v1.next());

        // Writer that read before the bump loses.
        assert!(store.write(&bumped, Some(v1)).await.unwrap_err().is_precondition_failed());
        // Create-only against an existing key loses.
        assert!(store.write(&view, None).await.unwrap_err().is_precondition_failed());

        let views = ViewStore::list(&store).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].count, 3);
        assert_eq!(views[0].total, 15.5);
    }
}
