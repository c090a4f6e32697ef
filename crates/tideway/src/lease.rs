//! Partition ownership across competing consumers
//!
//! Every process runs one coordinator with a unique owner id. Ownership is a
//! time-bounded lease row per partition; all lease writes are conditional on
//! the row's version, so a race between owners has exactly one winner.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    error::Result,
    observe::{self, LeaseEvent},
    traits::{ChangeFeed, LeaseStore},
    types::{Lease, PartitionId},
};
use tracing::{debug, info, warn};

pub struct LeaseCoordinator {
    owner_id: String,
    ttl: Duration,
    leases: Arc<dyn LeaseStore>,
    feed: Arc<dyn ChangeFeed>,
    /// Leases this owner believes it holds, with the last written version
    held: DashMap<PartitionId, Lease>,
}

impl LeaseCoordinator {
    pub fn new(
        owner_id: impl Into<String>,
        ttl: Duration,
        leases: Arc<dyn LeaseStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            ttl,
            leases,
            feed,
            held: DashMap::new(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Partitions held by this owner, sorted
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut owned: Vec<_> = self.held.iter().map(|e| e.key().clone()).collect();
        owned.sort();
        owned
    }

    pub fn is_owned(&self, partition_id: &str) -> bool {
        self.held.contains_key(partition_id)
    }

    /// Claim `partition_id` for `ttl` if it is free
    ///
    /// Succeeds when no lease exists, or the existing one is unowned or
    /// expired. Losing a race to another owner returns `Ok(false)`.
    pub async fn try_acquire(&self, partition_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        match self.leases.get(partition_id).await? {
            None => {
                let lease = Lease::unowned(partition_id).claimed_by(&self.owner_id, now, ttl);
                match self.leases.create(&lease).await {
                    Ok(version) => {
                        self.record_acquired(Lease { version, ..lease }, LeaseEvent::Acquired);
                        Ok(true)
                    }
                    Err(e) if e.is_precondition_failed() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(current) if current.is_held_by(&self.owner_id, now) => {
                self.held.insert(partition_id.to_string(), current);
                Ok(true)
            }
            Some(current) if current.is_available(now) => self.claim(&current, ttl).await,
            Some(_) => Ok(false),
        }
    }

    /// Extend a held lease by the configured ttl
    ///
    /// Returns `false` when the lease was stolen or has expired; the caller
    /// must stop processing the partition. Transient store errors are
    /// tolerated while the locally known expiry is still in the future.
    pub async fn renew(&self, partition_id: &str) -> bool {
        let Some(local) = self.held.get(partition_id).map(|e| e.value().clone()) else {
            return false;
        };

        let now = Utc::now();
        let renewed = local.claimed_by(&self.owner_id, now, self.ttl);
        match self.leases.replace(&renewed, local.version).await {
            Ok(version) => {
                self.held
                    .insert(partition_id.to_string(), Lease { version, ..renewed });
                debug!(partition_id, owner = %self.owner_id, "Renewed lease");
                true
            }
            Err(e) if e.is_precondition_failed() => self.reconcile_after_conflict(partition_id).await,
            Err(e) => {
                let still_valid = !local.is_expired(now);
                warn!(
                    partition_id,
                    owner = %self.owner_id,
                    error = %e,
                    still_valid,
                    "Lease renewal failed"
                );
                if !still_valid {
                    self.forget(partition_id);
                }
                still_valid
            }
        }
    }

    /// Give up a held lease so peers can pick it up immediately
    pub async fn release(&self, partition_id: &str) -> Result<()> {
        let Some((_, local)) = self.held.remove(partition_id) else {
            return Ok(());
        };
        observe::set_owned_partitions(self.held.len());

        match self.leases.replace(&local.released(), local.version).await {
            Ok(_) => {
                observe::record_lease_event(LeaseEvent::Released);
                info!(partition_id, owner = %self.owner_id, "Released lease");
                Ok(())
            }
            // Someone else already owns it; nothing left to release.
            Err(e) if e.is_precondition_failed() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release every held lease, logging failures
    pub async fn release_all(&self) {
        for partition_id in self.owned_partitions() {
            if let Err(e) = self.release(&partition_id).await {
                warn!(partition_id = %partition_id, error = %e, "Failed to release lease");
            }
        }
    }

    /// Drop a lease from the local view without writing to the store
    pub fn forget(&self, partition_id: &str) {
        if self.held.remove(partition_id).is_some() {
            observe::record_lease_event(LeaseEvent::Lost);
            observe::set_owned_partitions(self.held.len());
            info!(partition_id, owner = %self.owner_id, "Lease lost");
        }
    }

    /// One scan-and-reconcile pass
    ///
    /// Creates leases for new partitions, removes leases of vanished ones,
    /// claims free leases up to this owner's fair share, and steals at most
    /// one lease from the most loaded owner. Returns the partitions acquired
    /// (or adopted from a previous run under the same owner id).
    pub async fn rebalance(&self) -> Result<Vec<PartitionId>> {
        let now = Utc::now();
        let partitions: BTreeSet<PartitionId> =
            self.feed.list_partitions().await?.into_iter().collect();
        let existing = self.leases.list().await?;

        let mut leases = Vec::with_capacity(partitions.len());
        for lease in existing {
            if partitions.contains(&lease.partition_id) {
                leases.push(lease);
            } else if lease.is_available(now) {
                match self.leases.delete(&lease.partition_id, lease.version).await {
                    Ok(()) => info!(partition_id = %lease.partition_id, "Removed lease of vanished partition"),
                    Err(e) if e.is_precondition_failed() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let known: BTreeSet<PartitionId> = leases.iter().map(|l| l.partition_id.clone()).collect();
        for partition_id in partitions.difference(&known) {
            let lease = Lease::unowned(partition_id.as_str());
            match self.leases.create(&lease).await {
                Ok(version) => {
                    debug!(partition_id = %partition_id, "Created lease for new partition");
                    leases.push(Lease { version, ..lease });
                }
                Err(e) if e.is_precondition_failed() => {
                    if let Some(raced) = self.leases.get(partition_id).await? {
                        leases.push(raced);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut acquired = Vec::new();

        // Leases the store says are ours but we are not tracking (restart
        // under the same owner id).
        for lease in &leases {
            if lease.is_held_by(&self.owner_id, now) && !self.held.contains_key(&lease.partition_id) {
                info!(partition_id = %lease.partition_id, owner = %self.owner_id, "Adopted lease");
                self.held.insert(lease.partition_id.clone(), lease.clone());
                acquired.push(lease.partition_id.clone());
            }
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        counts.insert(self.owner_id.as_str(), 0);
        for lease in &leases {
            if let Some(owner) = lease.live_owner(now) {
                *counts.entry(owner).or_default() += 1;
            }
        }

        let target = fair_share(leases.len(), counts.len());
        let mut mine = counts.get(self.owner_id.as_str()).copied().unwrap_or(0);

        for lease in leases.iter().filter(|l| l.is_available(now)) {
            if mine >= target {
                break;
            }
            if self.claim(lease, self.ttl).await? {
                mine += 1;
                acquired.push(lease.partition_id.clone());
            }
        }

        if mine < target {
            let victim = counts
                .iter()
                .filter(|(owner, _)| **owner != self.owner_id)
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(owner, count)| (owner.to_string(), *count));

            if let Some((victim, count)) = victim {
                if count > target {
                    if let Some(lease) = leases
                        .iter()
                        .find(|l| l.live_owner(now) == Some(victim.as_str()))
                    {
                        if self.steal(lease).await? {
                            acquired.push(lease.partition_id.clone());
                        }
                    }
                }
            }
        }

        observe::set_owned_partitions(self.held.len());
        if !acquired.is_empty() {
            debug!(
                owner = %self.owner_id,
                acquired = acquired.len(),
                target,
                owners = counts.len(),
                "Rebalance pass acquired partitions"
            );
        }
        Ok(acquired)
    }

    async fn claim(&self, current: &Lease, ttl: Duration) -> Result<bool> {
        let lease = current.claimed_by(&self.owner_id, Utc::now(), ttl);
        match self.leases.replace(&lease, current.version).await {
            Ok(version) => {
                self.record_acquired(Lease { version, ..lease }, LeaseEvent::Acquired);
                Ok(true)
            }
            Err(e) if e.is_precondition_failed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn steal(&self, current: &Lease) -> Result<bool> {
        let lease = current.claimed_by(&self.owner_id, Utc::now(), self.ttl);
        match self.leases.replace(&lease, current.version).await {
            Ok(version) => {
                info!(
                    partition_id = %current.partition_id,
                    owner = %self.owner_id,
                    from = current.owner_id.as_deref().unwrap_or("-"),
                    "Stole lease"
                );
                self.record_acquired(Lease { version, ..lease }, LeaseEvent::Stolen);
                Ok(true)
            }
            Err(e) if e.is_precondition_failed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// After a failed conditional renew, check whether we still own the row
    async fn reconcile_after_conflict(&self, partition_id: &str) -> bool {
        match self.leases.get(partition_id).await {
            Ok(Some(stored)) if stored.is_held_by(&self.owner_id, Utc::now()) => {
                // An earlier write of ours landed but its reply was lost.
                self.held.insert(partition_id.to_string(), stored);
                true
            }
            Ok(_) => {
                self.forget(partition_id);
                false
            }
            Err(e) => {
                warn!(partition_id, error = %e, "Could not re-read lease after conflict");
                self.forget(partition_id);
                false
            }
        }
    }

    fn record_acquired(&self, lease: Lease, event: LeaseEvent) {
        let partition_id = lease.partition_id.clone();
        self.held.insert(partition_id.clone(), lease);
        observe::record_lease_event(event);
        observe::set_owned_partitions(self.held.len());
        if event == LeaseEvent::Acquired {
            info!(partition_id = %partition_id, owner = %self.owner_id, "Acquired lease");
        }
    }
}

/// ceil(partitions / owners)
fn fair_share(partitions: usize, owners: usize) -> usize {
    if owners == 0 {
        return partitions;
    }
    partitions.div_ceil(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn coordinator(store: &Arc<InMemoryStore>, owner: &str) -> LeaseCoordinator {
        LeaseCoordinator::new(owner, Duration::from_secs(60), store.clone(), store.clone())
    }

    #[test]
    fn test_fair_share() {
        assert_eq!(fair_share(3, 1), 3);
        assert_eq!(fair_share(3, 2), 2);
        assert_eq!(fair_share(4, 2), 2);
        assert_eq!(fair_share(0, 3), 0);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_expiry() {
        let store = Arc::new(InMemoryStore::with_partitions(1));
        let a = coordinator(&store, "a");
        let b = coordinator(&store, "b");

        assert!(a.try_acquire("p0", Duration::from_secs(60)).await.unwrap());
        assert!(!b.try_acquire("p0", Duration::from_secs(60)).await.unwrap());

        // Expired lease is up for grabs.
        let expired = store
            .get("p0")
            .await
            .unwrap()
            .unwrap()
            .claimed_by("a", Utc::now() - chrono::Duration::seconds(120), Duration::from_secs(60));
        store.force_lease(expired);
        assert!(b.try_acquire("p0", Duration::from_secs(60)).await.unwrap());
        assert!(!a.renew("p0").await);
        assert!(!a.is_owned("p0"));
    }

    #[tokio::test]
    async fn test_renew_tolerates_transient_errors_until_expiry() {
        let store = Arc::new(InMemoryStore::with_partitions(1));
        let a = coordinator(&store, "a");
        assert!(a.try_acquire("p0", Duration::from_secs(60)).await.unwrap());

        store.fail_next_lease_writes(1);
        assert!(a.renew("p0").await);
        assert!(a.renew("p0").await);
        assert!(a.is_owned("p0"));
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let store = Arc::new(InMemoryStore::with_partitions(1));
        let a = coordinator(&store, "a");
        let b = coordinator(&store, "b");

        a.try_acquire("p0", Duration::from_secs(60)).await.unwrap();
        a.release("p0").await.unwrap();
        assert!(a.owned_partitions().is_empty());

        let lease = store.get("p0").await.unwrap().unwrap();
        assert_eq!(lease.owner_id, None);
        assert!(b.try_acquire("p0", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rebalance_single_owner_takes_everything() {
        let store = Arc::new(InMemoryStore::with_partitions(3));
        let a = coordinator(&store, "a");

        let mut acquired = a.rebalance().await.unwrap();
        acquired.sort();
        assert_eq!(acquired, vec!["p0", "p1", "p2"]);
        assert_eq!(store.list().await.unwrap().len(), 3);
        assert!(a.rebalance().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_steals_one_lease_per_pass() {
        let store = Arc::new(InMemoryStore::with_partitions(4));
        let a = coordinator(&store, "a");
        let b = coordinator(&store, "b");

        assert_eq!(a.rebalance().await.unwrap().len(), 4);

        // b's fair share is 2, but it only takes one per pass.
        assert_eq!(b.rebalance().await.unwrap().len(), 1);
        assert_eq!(b.owned_partitions().len(), 1);
        assert_eq!(b.rebalance().await.unwrap().len(), 1);
        assert_eq!(b.owned_partitions().len(), 2);
        assert!(b.rebalance().await.unwrap().is_empty());

        // a notices the steals on renewal.
        let mut still_owned = 0;
        for p in a.owned_partitions() {
            if a.renew(&p).await {
                still_owned += 1;
            }
        }
        assert_eq!(still_owned, 2);
    }

    #[tokio::test]
    async fn test_rebalance_removes_vanished_partitions() {
        let store = Arc::new(InMemoryStore::with_partitions(2));
        let a = coordinator(&store, "a");
        a.rebalance().await.unwrap();
        a.release("p1").await.unwrap();

        store.remove_partition("p1");
        a.rebalance().await.unwrap();

        let leases = store.list().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].partition_id, "p0");
    }

    #[tokio::test]
    async fn test_rebalance_adopts_leases_from_previous_run() {
        let store = Arc::new(InMemoryStore::with_partitions(2));
        coordinator(&store, "a").rebalance().await.unwrap();

        let restarted = coordinator(&store, "a");
        let mut adopted = restarted.rebalance().await.unwrap();
        adopted.sort();
        assert_eq!(adopted, vec!["p0", "p1"]);
    }

    #[tokio::test]
    async fn test_default_owner_ids_do_not_share_leases() {
        use tideway_core::config::ProcessorConfig;

        let store = Arc::new(InMemoryStore::with_partitions(3));
        let a = coordinator(&store, &ProcessorConfig::default().host_name);
        let b = coordinator(&store, &ProcessorConfig::default().host_name);
        assert_ne!(a.owner_id(), b.owner_id());

        a.rebalance().await.unwrap();
        b.rebalance().await.unwrap();
        assert_eq!(b.owned_partitions().len(), 1);

        for p in a.owned_partitions() {
            a.renew(&p).await;
        }
        let owned_a = a.owned_partitions();
        let owned_b = b.owned_partitions();
        assert_eq!(owned_a.len() + owned_b.len(), 3);
        assert!(owned_a.iter().all(|p| !owned_b.contains(p)));
    }
}
