//! Change-feed processor host
//!
//! Wires the lease coordinator, pollers and dispatch pool together and runs
//! the periodic rebalance loop.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(InMemoryStore::with_partitions(3));
//! let running = ChangeFeedProcessorBuilder::new(ProcessorConfig::new("host_1"))
//!     .with_store(store.clone())
//!     .with_handler(handler_fn(|batch: Batch| async move { Ok(()) }))
//!     .build()?
//!     .start()?;
//!
//! // ... later
//! running.stop().await?;
//! ```

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tideway_core::{
    config::ProcessorConfig,
    error::{Result, TidewayError},
    traits::{ChangeFeed, ContinuationStore, DeadLetterSink, LeaseStore},
    types::PartitionId,
};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::continuation::ContinuationTracker;
use crate::dispatch::{DispatchMetricsSnapshot, DispatchPool};
use crate::handler::BatchHandler;
use crate::lease::LeaseCoordinator;
use crate::poller::{PartitionPoller, PollerExit, PollerState};
use crate::sink::LogDeadLetterSink;

/// Builder for [`ChangeFeedProcessor`]
pub struct ChangeFeedProcessorBuilder {
    config: ProcessorConfig,
    feed: Option<Arc<dyn ChangeFeed>>,
    leases: Option<Arc<dyn LeaseStore>>,
    continuations: Option<Arc<dyn ContinuationStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    handler: Option<Arc<dyn BatchHandler>>,
}

impl ChangeFeedProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            feed: None,
            leases: None,
            continuations: None,
            dead_letters: None,
            handler: None,
        }
    }

    /// Use one store for the feed, leases, continuations and dead letters
    pub fn with_store<S>(self, store: Arc<S>) -> Self
    where
        S: ChangeFeed + LeaseStore + ContinuationStore + DeadLetterSink + 'static,
    {
        self.with_feed(store.clone())
            .with_lease_store(store.clone())
            .with_continuation_store(store.clone())
            .with_dead_letter_sink(store)
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_lease_store(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_continuation_store(mut self, continuations: Arc<dyn ContinuationStore>) -> Self {
        self.continuations = Some(continuations);
        self
    }

    /// Defaults to logging dead letters when unset
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn with_handler(self, handler: impl BatchHandler + 'static) -> Self {
        self.with_shared_handler(Arc::new(handler))
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn BatchHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        self.config.validate()?;

        let feed = self
            .feed
            .ok_or_else(|| TidewayError::Config("change feed not set".to_string()))?;
        let leases = self
            .leases
            .ok_or_else(|| TidewayError::Config("lease store not set".to_string()))?;
        let continuations = self
            .continuations
            .ok_or_else(|| TidewayError::Config("continuation store not set".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| TidewayError::Config("handler not set".to_string()))?;
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(LogDeadLetterSink));

        let coordinator = Arc::new(LeaseCoordinator::new(
            self.config.host_name.clone(),
            self.config.lease_expiration(),
            leases,
            feed.clone(),
        ));

        Ok(ChangeFeedProcessor {
            config: Arc::new(self.config),
            feed,
            tracker: ContinuationTracker::new(continuations),
            coordinator,
            handler,
            dead_letters,
        })
    }
}

/// A configured, not yet running processor
pub struct ChangeFeedProcessor {
    config: Arc<ProcessorConfig>,
    feed: Arc<dyn ChangeFeed>,
    tracker: ContinuationTracker,
    coordinator: Arc<LeaseCoordinator>,
    handler: Arc<dyn BatchHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

struct PollerSlot {
    state: watch::Receiver<PollerState>,
    abort: AbortHandle,
}

struct Shared {
    coordinator: Arc<LeaseCoordinator>,
    pool: Arc<DispatchPool>,
    pollers: DashMap<PartitionId, PollerSlot>,
}

/// Point-in-time view of a running processor
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub owner_id: String,
    pub owned_partitions: Vec<PartitionId>,
    pub pollers: Vec<(PartitionId, PollerState)>,
    pub dispatch: DispatchMetricsSnapshot,
}

impl ChangeFeedProcessor {
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Spawn the dispatch pool and rebalance loop on the current runtime
    pub fn start(self) -> Result<RunningProcessor> {
        let pool = Arc::new(DispatchPool::start(
            &self.config.dispatch,
            self.handler.clone(),
            self.dead_letters.clone(),
        )?);

        let shared = Arc::new(Shared {
            coordinator: self.coordinator.clone(),
            pool,
            pollers: DashMap::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeout = self.config.shutdown_timeout();

        info!(
            owner = %self.config.host_name,
            workers = self.config.dispatch.worker_count,
            "Starting change feed processor"
        );

        let main = tokio::spawn(run(self, shared.clone(), shutdown_rx));

        Ok(RunningProcessor {
            shutdown: ShutdownHandle {
                tx: Arc::new(shutdown_tx),
            },
            main,
            shared,
            timeout,
        })
    }
}

async fn run(
    processor: ChangeFeedProcessor,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handles: HashMap<PartitionId, JoinHandle<PollerExit>> = HashMap::new();
    let mut tick = tokio::time::interval(processor.config.lease_acquire_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        reap_finished(&mut handles, &shared).await;

        if let Err(e) = processor.coordinator.rebalance().await {
            warn!(error = %e, "Rebalance pass failed");
        }

        for partition_id in processor.coordinator.owned_partitions() {
            if handles.contains_key(&partition_id) {
                continue;
            }
            let poller = PartitionPoller::new(
                partition_id.clone(),
                processor.config.clone(),
                processor.feed.clone(),
                processor.tracker.clone(),
                processor.coordinator.clone(),
                shared.pool.clone(),
            );
            let state = poller.subscribe();
            let handle = tokio::spawn(poller.run(shutdown.clone()));
            shared.pollers.insert(
                partition_id.clone(),
                PollerSlot {
                    state,
                    abort: handle.abort_handle(),
                },
            );
            handles.insert(partition_id, handle);
        }
    }

    info!(owner = %processor.config.host_name, "Draining pollers");
    for (partition_id, handle) in handles.drain() {
        match handle.await {
            Ok(exit) => tracing::debug!(partition_id = %partition_id, ?exit, "Poller drained"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(partition_id = %partition_id, error = %e, "Poller task failed"),
        }
        shared.pollers.remove(&partition_id);
    }

    shared.pool.shutdown().await;
    processor.coordinator.release_all().await;
    info!(owner = %processor.config.host_name, "Change feed processor stopped");
}

async fn reap_finished(handles: &mut HashMap<PartitionId, JoinHandle<PollerExit>>, shared: &Shared) {
    let finished: Vec<PartitionId> = handles
        .iter()
        .filter(|(_, h)| h.is_finished())
        .map(|(p, _)| p.clone())
        .collect();

    for partition_id in finished {
        let Some(handle) = handles.remove(&partition_id) else {
            continue;
        };
        shared.pollers.remove(&partition_id);
        match handle.await {
            Ok(PollerExit::Failed(reason)) => {
                error!(partition_id = %partition_id, reason = %reason, "Poller failed")
            }
            Ok(exit) => info!(partition_id = %partition_id, ?exit, "Poller finished"),
            Err(e) => error!(partition_id = %partition_id, error = %e, "Poller task panicked"),
        }
    }
}

/// Cloneable trigger for graceful shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A started processor
pub struct RunningProcessor {
    shutdown: ShutdownHandle,
    main: JoinHandle<()>,
    shared: Arc<Shared>,
    timeout: std::time::Duration,
}

impl RunningProcessor {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> ProcessorStats {
        let mut pollers: Vec<(PartitionId, PollerState)> = self
            .shared
            .pollers
            .iter()
            .map(|e| (e.key().clone(), *e.value().state.borrow()))
            .collect();
        pollers.sort_by(|a, b| a.0.cmp(&b.0));

        ProcessorStats {
            owner_id: self.shared.coordinator.owner_id().to_string(),
            owned_partitions: self.shared.coordinator.owned_partitions(),
            pollers,
            dispatch: self.shared.pool.metrics(),
        }
    }

    /// Signal shutdown and wait for pollers and workers to drain
    ///
    /// Tasks still running after the configured shutdown timeout are aborted
    /// and [`TidewayError::ShutdownTimeout`] is returned.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        self.wait().await
    }

    /// Wait for the processor to finish after a shutdown was triggered
    /// elsewhere (see [`ShutdownHandle`])
    pub async fn wait(mut self) -> Result<()> {
        if !self.shutdown.is_shutdown() {
            // Runs until someone triggers shutdown.
            let mut rx = self.shutdown.tx.subscribe();
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        match tokio::time::timeout(self.timeout, &mut self.main).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TidewayError::InvalidState(format!(
                "processor task failed: {}",
                e
            ))),
            Err(_) => {
                error!(timeout = ?self.timeout, "Shutdown timed out, aborting tasks");
                self.main.abort();
                for slot in self.shared.pollers.iter() {
                    slot.abort.abort();
                }
                self.shared.pool.abort();
                Err(TidewayError::ShutdownTimeout(self.timeout))
            }
        }
    }
}
