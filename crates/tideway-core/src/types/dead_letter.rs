use super::{Batch, ChangeRecord, PartitionId, ResumeToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A batch that exhausted its dispatch attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition_id: PartitionId,
    pub first_token: Option<ResumeToken>,
    pub last_token: Option<ResumeToken>,
    pub records: Vec<ChangeRecord>,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_batch(batch: &Batch, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            partition_id: batch.partition_id.clone(),
            first_token: batch.first_token(),
            last_token: batch.last_token(),
            records: batch.records.clone(),
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Rebuild the batch for replay
    pub fn to_batch(&self) -> Batch {
        Batch::new(self.partition_id.clone(), self.records.clone())
    }
}
