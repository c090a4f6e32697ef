//! Point-in-time report of partition ownership and progress

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tideway_core::{
    error::Result,
    traits::{ChangeFeed, ContinuationStore, LeaseStore},
    types::{PartitionId, ResumeToken},
};

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition_id: PartitionId,
    /// Live owner, if any
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub token: Option<ResumeToken>,
    pub latest_token: Option<ResumeToken>,
    /// Records in the partition not yet processed
    pub lag: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub partitions: Vec<PartitionStatus>,
}

impl StatusReport {
    pub fn total_lag(&self) -> u64 {
        self.partitions.iter().map(|p| p.lag).sum()
    }

    /// Number of partitions per live owner
    pub fn owners(&self) -> BTreeMap<String, usize> {
        let mut owners = BTreeMap::new();
        for partition in &self.partitions {
            if let Some(owner) = &partition.owner {
                *owners.entry(owner.clone()).or_insert(0) += 1;
            }
        }
        owners
    }
}

/// Collect ownership, token and lag for every partition of the feed
pub async fn collect(
    feed: &dyn ChangeFeed,
    leases: &dyn LeaseStore,
    continuations: &dyn ContinuationStore,
) -> Result<StatusReport> {
    let now = Utc::now();
    let leases: BTreeMap<PartitionId, _> = leases
        .list()
        .await?
        .into_iter()
        .map(|l| (l.partition_id.clone(), l))
        .collect();
    let tokens: BTreeMap<PartitionId, ResumeToken> =
        continuations.list().await?.into_iter().collect();

    let mut partitions = Vec::new();
    for partition_id in feed.list_partitions().await? {
        let latest_token = feed.latest_token(&partition_id).await?;
        let token = tokens.get(&partition_id).copied();
        let lease = leases.get(&partition_id);
        let owner = lease.and_then(|l| l.live_owner(now)).map(str::to_string);

        let lag = match (latest_token, token) {
            (Some(latest), Some(token)) => latest.value().saturating_sub(token.value()),
            (Some(latest), None) => latest.value(),
            (None, _) => 0,
        };

        partitions.push(PartitionStatus {
            partition_id,
            lease_expires_at: owner.as_ref().and(lease.map(|l| l.expires_at)),
            owner,
            token,
            latest_token,
            lag,
        });
    }

    Ok(StatusReport {
        generated_at: now,
        partitions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseCoordinator;
    use crate::memory::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lag_and_owner() {
        let store = Arc::new(InMemoryStore::with_partitions(2));
        for _ in 0..5 {
            store.push("p0", b"x".to_vec());
        }
        store.push("p1", b"y".to_vec());
        store
            .store("p0", ResumeToken::new(3), None)
            .await
            .unwrap();

        let coordinator =
            LeaseCoordinator::new("host-a", Duration::from_secs(60), store.clone(), store.clone());
        coordinator.try_acquire("p0", Duration::from_secs(60)).await.unwrap();

        let report = collect(store.as_ref(), store.as_ref(), store.as_ref())
            .await
            .unwrap();
        assert_eq!(report.partitions.len(), 2);

        let p0 = &report.partitions[0];
        assert_eq!(p0.owner.as_deref(), Some("host-a"));
        assert!(p0.lease_expires_at.is_some());
        assert_eq!(p0.lag, 2);

        let p1 = &report.partitions[1];
        assert_eq!(p1.owner, None);
        assert_eq!(p1.lag, 1);

        assert_eq!(report.total_lag(), 3);
        assert_eq!(report.owners().get("host-a"), Some(&1));
    }
}
