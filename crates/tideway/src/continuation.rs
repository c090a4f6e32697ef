use std::sync::Arc;
use tideway_core::{
    error::{Result, TidewayError},
    observe,
    traits::ContinuationStore,
    types::{PartitionId, ResumeToken},
};
use tracing::{debug, error};

/// Durable per-partition resume tokens
///
/// Tokens only move forward. Writes are conditional on the stored version, so
/// two owners racing on the same partition cannot both advance to a
/// non-increasing token.
#[derive(Clone)]
pub struct ContinuationTracker {
    store: Arc<dyn ContinuationStore>,
}

impl ContinuationTracker {
    pub fn new(store: Arc<dyn ContinuationStore>) -> Self {
        Self { store }
    }

    /// Last acknowledged token of a partition
    pub async fn get(&self, partition_id: &str) -> Result<Option<ResumeToken>> {
        Ok(self.store.load(partition_id).await?.map(|(token, _)| token))
    }

    /// Record that everything up to and including `new_token` was processed
    ///
    /// Fails with [`TidewayError::StaleToken`] when `new_token` does not move
    /// past the stored token; the stored state is left untouched.
    pub async fn advance(&self, partition_id: &str, new_token: ResumeToken) -> Result<()> {
        loop {
            let current = self.store.load(partition_id).await?;

            let expected = match current {
                Some((stored, _)) if new_token <= stored => {
                    error!(
                        partition_id,
                        stored = %stored,
                        attempted = %new_token,
                        "Rejected non-increasing token advance"
                    );
                    return Err(TidewayError::StaleToken {
                        partition_id: partition_id.to_string(),
                        current: stored,
                        attempted: new_token,
                    });
                }
                Some((_, version)) => Some(version),
                None => None,
            };

            match self.store.store(partition_id, new_token, expected).await {
                Ok(_) => {
                    observe::record_token_advance(partition_id);
                    debug!(partition_id, token = %new_token, "Advanced continuation");
                    return Ok(());
                }
                Err(e) if e.is_precondition_failed() => {
                    // Someone else wrote in between; re-read and re-check.
                    observe::record_cas_conflict("continuation");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Every partition's stored token
    pub async fn snapshot(&self) -> Result<Vec<(PartitionId, ResumeToken)>> {
        self.store.list().await
    }
}
