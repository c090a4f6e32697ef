use crate::error::Result;
use crate::types::{AggregateView, PartitionId, ResumeToken, VersionTag};
use async_trait::async_trait;

/// Durable resume tokens, one per partition
#[async_trait]
pub trait ContinuationStore: Send + Sync {
    async fn load(&self, partition_id: &str) -> Result<Option<(ResumeToken, VersionTag)>>;

    /// Store `token` if the current version equals `expected`
    ///
    /// `expected = None` requires that no token is stored yet.
    async fn store(
        &self,
        partition_id: &str,
        token: ResumeToken,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag>;

    async fn list(&self) -> Result<Vec<(PartitionId, ResumeToken)>>;
}

/// Storage for materialized aggregate views
#[async_trait]
pub trait ViewStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<AggregateView>>;

    /// Write `view` if the stored version equals `expected`
    ///
    /// `expected = None` means create-only. The `version_tag` field of `view`
    /// is ignored; the store returns the newly assigned tag.
    async fn write(&self, view: &AggregateView, expected: Option<VersionTag>) -> Result<VersionTag>;

    async fn list(&self) -> Result<Vec<AggregateView>>;
}
