use super::{PartitionId, VersionTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time-bounded ownership grant over a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub partition_id: PartitionId,
    /// `None` once released or before first claim
    pub owner_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Concurrency tag assigned by the lease store on every write
    pub version: VersionTag,
}

impl Lease {
    /// An unowned lease for a newly discovered partition
    pub fn unowned(partition_id: impl Into<PartitionId>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner_id: None,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
            version: VersionTag::INITIAL,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether anyone can claim this lease right now
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.owner_id.is_none() || self.is_expired(now)
    }

    /// Owner of the lease if it is still live
    pub fn live_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            None
        } else {
            self.owner_id.as_deref()
        }
    }

    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.live_owner(now) == Some(owner_id)
    }

    /// Copy of this lease claimed by `owner_id` until `now + ttl`
    pub fn claimed_by(&self, owner_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            partition_id: self.partition_id.clone(),
            owner_id: Some(owner_id.to_string()),
            expires_at: expiry(now, ttl),
            version: self.version,
        }
    }

    /// Copy of this lease with ownership cleared
    pub fn released(&self) -> Self {
        Self {
            partition_id: self.partition_id.clone(),
            owner_id: None,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
            version: self.version,
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
