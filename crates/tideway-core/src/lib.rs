//! Tideway Core: traits and types for the change-feed pipeline
//!
//! This crate defines the narrow interface between the pipeline and the
//! store it consumes:
//! - Change feed: partitioned, append-only stream of change records
//! - Lease store: conditional-write table used for partition ownership
//! - Continuation store: per-partition resume tokens
//! - View store: materialized aggregates guarded by version tags
//! - Sinks: dead letters and downstream endpoints
//!
//! Implementations live in `tideway-sqlite` (durable, multi-process) and
//! `tideway::memory` (in-process simulation).

pub mod config;
pub mod error;
pub mod observe;
pub mod traits;
pub mod types;

pub use config::{DispatchConfig, ProcessorConfig, SqliteConfig, StartPosition, SynchronousMode};
pub use error::{Result, TidewayError};
pub use traits::{
    Appender, ChangeFeed, ContinuationStore, DeadLetterSink, DownstreamSink, LeaseStore, ViewStore,
};
pub use types::{
    AggregateView, Batch, ChangeRecord, DeadLetter, Delta, FeedPage, Lease, PartitionId,
    ResumeToken, VersionTag,
};
