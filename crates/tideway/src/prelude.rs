//! Tideway Prelude
//!
//! ```
//! use tideway::prelude::*;
//! ```

// Core types
pub use crate::{
    AggregateView, Batch, ChangeRecord, DeadLetter, Delta, Lease, PartitionId, Result,
    ResumeToken, TidewayError, VersionTag,
};

// Configs
pub use crate::{DispatchConfig, ProcessorConfig, StartPosition};

// Store traits
pub use tideway_core::traits::{
    Appender, ChangeFeed, ContinuationStore, DeadLetterSink, DownstreamSink, LeaseStore, ViewStore,
};

// Pipeline
pub use crate::{
    handler_fn, BatchHandler, ChangeFeedProcessor, ChangeFeedProcessorBuilder,
    ContinuationTracker, DispatchOutcome, DispatchPool, LeaseCoordinator, Materializer,
    RunningProcessor, ShutdownHandle,
};

// Implementations
pub use crate::{
    CartAction, CopyHandler, DataGenerator, ForwardingHandler, HttpSink, InMemoryStore,
    StateSalesHandler,
};

// Re-export common external deps
pub use anyhow;
pub use std::sync::Arc;
pub use tracing;
