use crate::error::Result;
use crate::types::{FeedPage, PartitionId, ResumeToken};
use async_trait::async_trait;

/// Read side of a partitioned, append-only change stream
///
/// Implement this for the source store. Fetches must return records of one
/// partition in token order, strictly after `after`.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// All partitions currently present in the stream
    async fn list_partitions(&self) -> Result<Vec<PartitionId>>;

    /// Fetch at most `max_items` records of `partition_id` after `after`
    ///
    /// `after = None` reads from the beginning of the partition.
    async fn fetch_changes(
        &self,
        partition_id: &str,
        after: Option<ResumeToken>,
        max_items: usize,
    ) -> Result<FeedPage>;

    /// Token of the newest record in the partition, if any
    async fn latest_token(&self, partition_id: &str) -> Result<Option<ResumeToken>>;
}

/// Write side of a change stream (used by generators and copy handlers)
#[async_trait]
pub trait Appender: Send + Sync {
    async fn append(&self, partition_id: &str, payload: &[u8]) -> Result<ResumeToken>;
}
