use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition (shard) identifier of the change stream
pub type PartitionId = String;

/// Position in a partition's change stream.
///
/// Tokens are strictly monotonic within a partition. A stored token means
/// every record up to and including it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(u64);

impl ResumeToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One mutation observed in the source store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub partition_id: PartitionId,
    pub token: ResumeToken,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(partition_id: impl Into<PartitionId>, token: ResumeToken, payload: Vec<u8>) -> Self {
        Self {
            partition_id: partition_id.into(),
            token,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered records fetched by a single poll of one partition
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub partition_id: PartitionId,
    pub records: Vec<ChangeRecord>,
}

impl Batch {
    pub fn new(partition_id: impl Into<PartitionId>, records: Vec<ChangeRecord>) -> Self {
        Self {
            partition_id: partition_id.into(),
            records,
        }
    }

    pub fn empty(partition_id: impl Into<PartitionId>) -> Self {
        Self::new(partition_id, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_token(&self) -> Option<ResumeToken> {
        self.records.first().map(|r| r.token)
    }

    /// Token to checkpoint once the whole batch has been handled
    pub fn last_token(&self) -> Option<ResumeToken> {
        self.records.last().map(|r| r.token)
    }

    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

/// Result of a single `fetch_changes` call
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub batch: Batch,
    /// Token to pass as `after` on the next fetch. Equals the input token when
    /// the page is empty.
    pub continuation: Option<ResumeToken>,
}

impl FeedPage {
    pub fn new(batch: Batch, after: Option<ResumeToken>) -> Self {
        let continuation = batch.last_token().or(after);
        Self {
            batch,
            continuation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ordering() {
        assert!(ResumeToken::new(2) > ResumeToken::new(1));
        assert_eq!(ResumeToken::new(9).value(), 9);
        assert_eq!(serde_json::to_string(&ResumeToken::new(42)).unwrap(), "42");
    }

    #[test]
    fn test_batch_tokens() {
        let records = (1..=3)
            .map(|i| ChangeRecord::new("p0", ResumeToken::new(i), vec![i as u8]))
            .collect();
        let batch = Batch::new("p0", records);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_token(), Some(ResumeToken::new(1)));
        assert_eq!(batch.last_token(), Some(ResumeToken::new(3)));
        assert_eq!(batch.payload_bytes(), 3);
    }

    #[test]
    fn test_empty_page_keeps_continuation() {
        let page = FeedPage::new(Batch::empty("p0"), Some(ResumeToken::new(5)));
        assert!(page.batch.is_empty());
        assert_eq!(page.continuation, Some(ResumeToken::new(5)));
    }
}
