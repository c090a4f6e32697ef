//! Batch handlers
//!
//! A handler receives every batch fetched from an owned partition. Delivery
//! is at-least-once: a batch may be handed over again after a crash, a lease
//! steal, or a retry, so handlers must tolerate replays or accept their
//! effect.
//!
//! # Example
//!
//! ```no_run
//! use tideway::handler::{handler_fn, BatchHandler};
//! use tideway_core::{Batch, Result};
//!
//! let printer = handler_fn(|batch: Batch| async move {
//!     for record in &batch.records {
//!         println!("{} {}", batch.partition_id, record.token);
//!     }
//!     Ok(())
//! });
//! ```

use async_trait::async_trait;
use std::future::Future;
use tideway_core::{error::Result, types::Batch};

/// User code applied to each dispatched batch
///
/// Returning an error (or panicking) makes the dispatch pool retry the batch
/// with backoff until the attempt ceiling, after which it is dead-lettered.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, batch: &Batch) -> Result<()>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`BatchHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Batch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> BatchHandler for FnHandler<F>
where
    F: Fn(Batch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        "fn"
    }

    async fn handle(&self, batch: &Batch) -> Result<()> {
        (self.f)(batch.clone()).await
    }
}
