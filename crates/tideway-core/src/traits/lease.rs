use crate::error::Result;
use crate::types::{Lease, VersionTag};
use async_trait::async_trait;

/// Persistent lease table keyed by partition id
///
/// Every write is conditional. Implementations must guarantee that when two
/// writers present the same expected version, at most one of them succeeds and
/// the other receives `TidewayError::PreconditionFailed`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>>;

    async fn list(&self) -> Result<Vec<Lease>>;

    /// Insert a lease that must not exist yet
    ///
    /// Returns the version assigned by the store.
    async fn create(&self, lease: &Lease) -> Result<VersionTag>;

    /// Overwrite the lease if its stored version still equals `expected`
    async fn replace(&self, lease: &Lease, expected: VersionTag) -> Result<VersionTag>;

    /// Remove the lease if its stored version still equals `expected`
    async fn delete(&self, partition_id: &str, expected: VersionTag) -> Result<()>;
}
