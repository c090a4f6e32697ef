use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tideway_core::{
    error::{Result, TidewayError},
    traits::LeaseStore,
    types::{Lease, VersionTag},
};

use crate::store::{from_millis, map_sqlite_err, SqliteStore};

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let expires_at_ms: i64 = row.get(2)?;
    let version: i64 = row.get(3)?;
    Ok(Lease {
        partition_id: row.get(0)?,
        owner_id: row.get(1)?,
        expires_at: from_millis(expires_at_ms),
        version: VersionTag::new(version as u64),
    })
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT partition_id, owner_id, expires_at_ms, version
                 FROM leases WHERE partition_id = ?1",
                [&partition_id],
                row_to_lease,
            )
            .optional()
            .map_err(map_sqlite_err)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT partition_id, owner_id, expires_at_ms, version
                     FROM leases ORDER BY partition_id",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt.query_map([], row_to_lease).map_err(map_sqlite_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)
        })
        .await
    }

    async fn create(&self, lease: &Lease) -> Result<VersionTag> {
        let lease = lease.clone();
        self.call(move |conn| {
            let version = VersionTag::INITIAL.next();
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO leases (partition_id, owner_id, expires_at_ms, version)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        lease.partition_id,
                        lease.owner_id,
                        lease.expires_at.timestamp_millis(),
                        version.value() as i64
                    ],
                )
                .map_err(map_sqlite_err)?;

            if inserted == 0 {
                return Err(TidewayError::PreconditionFailed(format!(
                    "lease for partition {} already exists",
                    lease.partition_id
                )));
            }
            Ok(version)
        })
        .await
    }

    async fn replace(&self, lease: &Lease, expected: VersionTag) -> Result<VersionTag> {
        let lease = lease.clone();
        self.call(move |conn| {
            let next = expected.next();
            let updated = conn
                .execute(
                    "UPDATE leases SET owner_id = ?1, expires_at_ms = ?2, version = ?3
                     WHERE partition_id = ?4 AND version = ?5",
                    params![
                        lease.owner_id,
                        lease.expires_at.timestamp_millis(),
                        next.value() as i64,
                        lease.partition_id,
                        expected.value() as i64
                    ],
                )
                .map_err(map_sqlite_err)?;

            if updated == 0 {
                return Err(TidewayError::PreconditionFailed(format!(
                    "lease for partition {} is no longer at {}",
                    lease.partition_id, expected
                )));
            }
            Ok(next)
        })
        .await
    }

    async fn delete(&self, partition_id: &str, expected: VersionTag) -> Result<()> {
        let partition_id = partition_id.to_string();
        self.call(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM leases WHERE partition_id = ?1 AND version = ?2",
                    params![partition_id, expected.value() as i64],
                )
                .map_err(map_sqlite_err)?;

            if deleted == 0 {
                return Err(TidewayError::PreconditionFailed(format!(
                    "lease for partition {} is no longer at {}",
                    partition_id, expected
                )));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_is_insert_only() {
        let (_dir, store) = open_temp();
        let lease = Lease::unowned("p0");

        let v1 = store.create(&lease).await.unwrap();
        assert_eq!(v1, VersionTag::new(1));

        let err = store.create(&lease).await.unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_replace_requires_matching_version() {
        let (_dir, store) = open_temp();
        let v1 = store.create(&Lease::unowned("p0")).await.unwrap();
        let stored = store.get("p0").await.unwrap().unwrap();
        let now = Utc::now();

        let mine = stored.claimed_by("host-a", now, Duration::from_secs(30));
        let v2 = store.replace(&mine, v1).await.unwrap();
        assert_eq!(v2, VersionTag::new(2));

        // A second writer still holding v1 loses.
        let theirs = stored.claimed_by("host-b", now, Duration::from_secs(30));
        assert!(store.replace(&theirs, v1).await.unwrap_err().is_precondition_failed());

        let current = store.get("p0").await.unwrap().unwrap();
        assert_eq!(current.owner_id.as_deref(), Some("host-a"));
        assert_eq!(current.version, v2);
        assert!(current.is_held_by("host-a", now));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (_dir, store) = open_temp();
        let v0 = store.create(&Lease::unowned("p0")).await.unwrap();
        store.create(&Lease::unowned("p1")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete("p0", v0.next()).await.unwrap_err().is_precondition_failed());
        store.delete("p0", v0).await.unwrap();

        let remaining = store.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].partition_id, "p1");
        assert!(store.get("p0").await.unwrap().is_none());
    }
}
