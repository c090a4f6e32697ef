//! Tideway: lease-coordinated change-feed processing
//!
//! Consumes a partitioned, append-only change stream with one or more
//! competing processes:
//! - Lease coordinator: spreads partitions across live owners, steals from
//!   overloaded ones, and detects lost leases on renewal
//! - Pollers: one task per owned partition fetching batches after the stored
//!   resume token
//! - Dispatch pool: bounded queue and fixed workers running the user handler
//!   with retries, backoff, panic isolation and dead-lettering
//! - Continuation tracker: strictly increasing per-partition tokens, advanced
//!   only after a batch is handled (at-least-once delivery)
//! - Materializer: conditional-write aggregation into keyed views
//!
//! # Example
//!
//! ```ignore
//! use tideway::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::with_partitions(3));
//! let materializer = Arc::new(Materializer::new(store.clone()));
//!
//! let running = ChangeFeedProcessorBuilder::new(ProcessorConfig::new("host_1"))
//!     .with_store(store.clone())
//!     .with_handler(StateSalesHandler::new(materializer))
//!     .build()?
//!     .start()?;
//!
//! running.stop().await?;
//! ```

pub mod backoff;
pub mod cart;
pub mod continuation;
pub mod dispatch;
pub mod generator;
pub mod handler;
pub mod lease;
pub mod materializer;
pub mod memory;
pub mod poller;
pub mod prelude;
pub mod processor;
pub mod sink;
pub mod status;

pub use backoff::BackoffStrategy;
pub use cart::{ActionType, CartAction, StateSalesHandler};
pub use continuation::ContinuationTracker;
pub use dispatch::{Completion, DispatchMetricsSnapshot, DispatchOutcome, DispatchPool};
pub use generator::DataGenerator;
pub use handler::{handler_fn, BatchHandler};
pub use lease::LeaseCoordinator;
pub use materializer::Materializer;
pub use memory::InMemoryStore;
pub use poller::{PartitionPoller, PollerExit, PollerState};
pub use processor::{
    ChangeFeedProcessor, ChangeFeedProcessorBuilder, ProcessorStats, RunningProcessor,
    ShutdownHandle,
};
pub use sink::{CopyHandler, ForwardingHandler, HttpSink, LogDeadLetterSink};
pub use status::{PartitionStatus, StatusReport};

pub use tideway_core::{
    AggregateView, Batch, ChangeRecord, DeadLetter, Delta, DispatchConfig, Lease, PartitionId,
    ProcessorConfig, Result, ResumeToken, StartPosition, TidewayError, VersionTag,
};
