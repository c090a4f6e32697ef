//! Two store handles opened on the same file behave like two processes
//! sharing the database.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    traits::{Appender, ChangeFeed, ContinuationStore, LeaseStore},
    types::{Lease, ResumeToken},
    SqliteConfig,
};
use tideway_sqlite::SqliteStore;

fn open_pair() -> (tempfile::TempDir, SqliteStore, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = SqliteStore::open(SqliteConfig::new(&path)).unwrap();
    let b = SqliteStore::open(SqliteConfig::new(&path)).unwrap();
    (dir, a, b)
}

#[tokio::test]
async fn test_only_one_handle_claims_a_lease() {
    let (_dir, a, b) = open_pair();
    a.create(&Lease::unowned("p0")).await.unwrap();

    let seen = b.get("p0").await.unwrap().unwrap();
    let now = Utc::now();
    let ttl = Duration::from_secs(30);

    let first = a.replace(&seen.claimed_by("host-a", now, ttl), seen.version).await;
    let second = b.replace(&seen.claimed_by("host-b", now, ttl), seen.version).await;

    assert!(first.is_ok());
    assert!(second.unwrap_err().is_precondition_failed());
    let lease = b.get("p0").await.unwrap().unwrap();
    assert!(lease.is_held_by("host-a", Utc::now()));
}

#[tokio::test]
async fn test_concurrent_appends_never_reuse_tokens() {
    let (_dir, a, b) = open_pair();
    let a = Arc::new(a);
    let b = Arc::new(b);

    let mut handles = Vec::new();
    for i in 0..20u8 {
        let store = if i % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move { store.append("p0", &[i]).await.unwrap() }));
    }

    let mut tokens = Vec::new();
    for h in handles {
        tokens.push(h.await.unwrap().value());
    }
    tokens.sort_unstable();
    assert_eq!(tokens, (1..=20).collect::<Vec<_>>());
    assert_eq!(a.latest_token("p0").await.unwrap(), Some(ResumeToken::new(20)));
}

#[tokio::test]
async fn test_continuation_visible_across_handles() {
    let (_dir, a, b) = open_pair();
    let v1 = a.store("p0", ResumeToken::new(10), None).await.unwrap();

    let (token, version) = b.load("p0").await.unwrap().unwrap();
    assert_eq!(token, ResumeToken::new(10));
    assert_eq!(version, v1);

    b.store("p0", ResumeToken::new(12), Some(version)).await.unwrap();
    assert!(a
        .store("p0", ResumeToken::new(11), Some(v1))
        .await
        .unwrap_err()
        .is_precondition_failed());
}
