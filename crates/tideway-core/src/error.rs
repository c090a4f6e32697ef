use crate::types::{PartitionId, ResumeToken};
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidewayError {
    /// Network failure, timeout, or a store that is temporarily busy.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Optimistic concurrency conflict on a conditional write.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Stale token for partition {partition_id}: stored {current}, attempted {attempted}")]
    StaleToken {
        partition_id: PartitionId,
        current: ResumeToken,
        attempted: ResumeToken,
    },

    #[error("Lease lost for partition {0}")]
    LeaseLost(PartitionId),

    #[error("Handler failed after {attempts} attempt(s): {message}")]
    HandlerFailure { attempts: u32, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl TidewayError {
    /// Whether the failed call may succeed if simply retried after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, TidewayError::Transient(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, TidewayError::PreconditionFailed(_))
    }

    /// Build a handler failure from any displayable error.
    pub fn handler(attempts: u32, err: impl std::fmt::Display) -> Self {
        TidewayError::HandlerFailure {
            attempts,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TidewayError {
    fn from(err: serde_json::Error) -> Self {
        TidewayError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TidewayError>;

// Handler errors:
//
// User handlers return `tideway_core::Result<()>`. Any error type implementing
// `std::error::Error + Send + Sync + 'static` converts through the
// `#[from] anyhow::Error` variant:
//
//     fn decode(bytes: &[u8]) -> Result<MyEvent> {
//         let event = my_codec::decode(bytes).map_err(anyhow::Error::from)?;
//         Ok(event)
//     }
//
// The dispatch pool treats every handler error the same way (retry, then
// dead-letter), so the variant chosen only matters for logging.
