use crate::error::Result;
use crate::types::{Batch, DeadLetter};
use async_trait::async_trait;

/// Destination for batches that exhausted their dispatch attempts
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()>;
}

/// External endpoint receiving batches (reporting services, webhooks)
///
/// The pipeline imposes no retry contract: the returned status is only logged.
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    async fn post(&self, batch: &Batch) -> Result<u16>;
}
