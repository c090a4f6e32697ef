//! In-process implementation of every store trait
//!
//! Used by tests and local simulations. All state lives behind one mutex, so
//! every conditional write is atomic with respect to the others. Transient
//! faults can be injected to exercise retry paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tideway_core::{
    error::{Result, TidewayError},
    traits::{
        Appender, ChangeFeed, ContinuationStore, DeadLetterSink, LeaseStore, ViewStore,
    },
    types::{
        AggregateView, Batch, ChangeRecord, DeadLetter, FeedPage, Lease, PartitionId,
        ResumeToken, VersionTag,
    },
};

#[derive(Default)]
struct State {
    feed: BTreeMap<PartitionId, Vec<ChangeRecord>>,
    leases: BTreeMap<PartitionId, Lease>,
    continuations: BTreeMap<PartitionId, (ResumeToken, VersionTag)>,
    views: HashMap<String, AggregateView>,
    dead_letters: Vec<DeadLetter>,
}

/// Shared in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fetch_faults: AtomicU32,
    renew_faults: AtomicU32,
    view_faults: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `partitions` empty partitions named `p0..pN`
    pub fn with_partitions(partitions: usize) -> Self {
        let store = Self::new();
        for i in 0..partitions {
            store.create_partition(&format!("p{}", i));
        }
        store
    }

    pub fn create_partition(&self, partition_id: &str) {
        self.state
            .lock()
            .feed
            .entry(partition_id.to_string())
            .or_default();
    }

    /// Drop a partition and its records (simulates a split or deletion)
    pub fn remove_partition(&self, partition_id: &str) {
        self.state.lock().feed.remove(partition_id);
    }

    /// Append synchronously; convenient for seeding tests
    pub fn push(&self, partition_id: &str, payload: impl Into<Vec<u8>>) -> ResumeToken {
        let mut state = self.state.lock();
        let records = state.feed.entry(partition_id.to_string()).or_default();
        let token = ResumeToken::new(records.last().map(|r| r.token.value()).unwrap_or(0) + 1);
        records.push(ChangeRecord::new(partition_id, token, payload.into()));
        token
    }

    /// Make the next `n` feed fetches fail with a transient error
    pub fn fail_next_fetches(&self, n: u32) {
        self.fetch_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` lease replacements fail with a transient error
    pub fn fail_next_lease_writes(&self, n: u32) {
        self.renew_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` view writes fail with a transient error
    pub fn fail_next_view_writes(&self, n: u32) {
        self.view_faults.store(n, Ordering::SeqCst);
    }

    /// Overwrite a lease regardless of its version (simulates another process)
    pub fn force_lease(&self, lease: Lease) {
        let mut state = self.state.lock();
        let version = state
            .leases
            .get(&lease.partition_id)
            .map(|l| l.version.next())
            .unwrap_or(VersionTag::INITIAL.next());
        state.leases.insert(
            lease.partition_id.clone(),
            Lease { version, ..lease },
        );
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryStore {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(self.state.lock().feed.keys().cloned().collect())
    }

    async fn fetch_changes(
        &self,
        partition_id: &str,
        after: Option<ResumeToken>,
        max_items: usize,
    ) -> Result<FeedPage> {
        if Self::take_fault(&self.fetch_faults) {
            return Err(TidewayError::Transient("injected fetch fault".to_string()));
        }

        let state = self.state.lock();
        let records = state
            .feed
            .get(partition_id)
            .ok_or_else(|| TidewayError::NotFound(format!("partition {}", partition_id)))?;

        let batch: Vec<ChangeRecord> = records
            .iter()
            .filter(|r| after.map_or(true, |a| r.token > a))
            .take(max_items)
            .cloned()
            .collect();

        Ok(FeedPage::new(Batch::new(partition_id, batch), after))
    }

    async fn latest_token(&self, partition_id: &str) -> Result<Option<ResumeToken>> {
        Ok(self
            .state
            .lock()
            .feed
            .get(partition_id)
            .and_then(|records| records.last().map(|r| r.token)))
    }
}

#[async_trait]
impl Appender for InMemoryStore {
    async fn append(&self, partition_id: &str, payload: &[u8]) -> Result<ResumeToken> {
        Ok(self.push(partition_id, payload.to_vec()))
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        Ok(self.state.lock().leases.get(partition_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        Ok(self.state.lock().leases.values().cloned().collect())
    }

    async fn create(&self, lease: &Lease) -> Result<VersionTag> {
        let mut state = self.state.lock();
        if state.leases.contains_key(&lease.partition_id) {
            return Err(TidewayError::PreconditionFailed(format!(
                "lease for partition {} already exists",
                lease.partition_id
            )));
        }
        let version = VersionTag::INITIAL.next();
        state.leases.insert(
            lease.partition_id.clone(),
            Lease {
                version,
                ..lease.clone()
            },
        );
        Ok(version)
    }

    async fn replace(&self, lease: &Lease, expected: VersionTag) -> Result<VersionTag> {
        if Self::take_fault(&self.renew_faults) {
            return Err(TidewayError::Transient("injected lease fault".to_string()));
        }

        let mut state = self.state.lock();
        let stored = state.leases.get_mut(&lease.partition_id).ok_or_else(|| {
            TidewayError::PreconditionFailed(format!("lease {} missing", lease.partition_id))
        })?;
        if stored.version != expected {
            return Err(TidewayError::PreconditionFailed(format!(
                "lease for partition {} is at {}, expected {}",
                lease.partition_id, stored.version, expected
            )));
        }
        let version = expected.next();
        *stored = Lease {
            version,
            ..lease.clone()
        };
        Ok(version)
    }

    async fn delete(&self, partition_id: &str, expected: VersionTag) -> Result<()> {
        let mut state = self.state.lock();
        match state.leases.get(partition_id) {
            Some(stored) if stored.version == expected => {
                state.leases.remove(partition_id);
                Ok(())
            }
            _ => Err(TidewayError::PreconditionFailed(format!(
                "lease for partition {} is no longer at {}",
                partition_id, expected
            ))),
        }
    }
}

#[async_trait]
impl ContinuationStore for InMemoryStore {
    async fn load(&self, partition_id: &str) -> Result<Option<(ResumeToken, VersionTag)>> {
        Ok(self.state.lock().continuations.get(partition_id).copied())
    }

    async fn store(
        &self,
        partition_id: &str,
        token: ResumeToken,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag> {
        let mut state = self.state.lock();
        let current = state.continuations.get(partition_id).map(|(_, v)| *v);
        if current != expected {
            return Err(TidewayError::PreconditionFailed(format!(
                "continuation for partition {} changed concurrently",
                partition_id
            )));
        }
        let version = expected.unwrap_or(VersionTag::INITIAL).next();
        state
            .continuations
            .insert(partition_id.to_string(), (token, version));
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<(PartitionId, ResumeToken)>> {
        Ok(self
            .state
            .lock()
            .continuations
            .iter()
            .map(|(p, (token, _))| (p.clone(), *token))
            .collect())
    }
}

#[async_trait]
impl ViewStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<AggregateView>> {
        Ok(self.state.lock().views.get(key).cloned())
    }

    async fn write(&self, view: &AggregateView, expected: Option<VersionTag>) -> Result<VersionTag> {
        if Self::take_fault(&self.view_faults) {
            return Err(TidewayError::Transient("database is locked".to_string()));
        }
        let mut state = self.state.lock();
        let current = state.views.get(&view.key).and_then(|v| v.version_tag);
        if current != expected {
            return Err(TidewayError::PreconditionFailed(format!("view {}", view.key)));
        }
        let version = expected.unwrap_or(VersionTag::INITIAL).next();
        state.views.insert(
            view.key.clone(),
            AggregateView {
                version_tag: Some(version),
                ..view.clone()
            },
        );
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<AggregateView>> {
        let mut views: Vec<_> = self.state.lock().views.values().cloned().collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(views)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryStore {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        self.state.lock().dead_letters.push(dead_letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_fetch_filters_by_token() {
        let store = InMemoryStore::with_partitions(2);
        for i in 0..4u8 {
            store.push("p0", vec![i]);
        }

        let page = store.fetch_changes("p0", Some(ResumeToken::new(2)), 10).await.unwrap();
        assert_eq!(page.batch.len(), 2);
        assert_eq!(page.continuation, Some(ResumeToken::new(4)));
        assert!(store.fetch_changes("p1", None, 10).await.unwrap().batch.is_empty());
        assert!(store.fetch_changes("p9", None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_fetch_faults_are_transient() {
        let store = InMemoryStore::with_partitions(1);
        store.fail_next_fetches(2);

        assert!(store.fetch_changes("p0", None, 1).await.unwrap_err().is_transient());
        assert!(store.fetch_changes("p0", None, 1).await.unwrap_err().is_transient());
        assert!(store.fetch_changes("p0", None, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_versions() {
        let store = InMemoryStore::new();
        let v1 = store.create(&Lease::unowned("p0")).await.unwrap();
        let lease = store.get("p0").await.unwrap().unwrap();
        assert_eq!(lease.version, v1);

        let claimed = lease.claimed_by("a", Utc::now(), std::time::Duration::from_secs(5));
        let v2 = store.replace(&claimed, v1).await.unwrap();
        assert!(store.replace(&claimed, v1).await.unwrap_err().is_precondition_failed());
        assert!(store.delete("p0", v1).await.is_err());
        store.delete("p0", v2).await.unwrap();
    }
}
