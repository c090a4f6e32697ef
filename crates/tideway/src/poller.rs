//! Per-partition poll loop
//!
//! ```text
//! Idle -> Leased -> Polling -> Dispatching -> Leased -> ...
//!                                   \-> Stopped (lease lost, stale token,
//!                                        partition removed, shutdown)
//! ```
//!
//! The resume token is advanced only after the dispatch pool reports the
//! batch applied or dead-lettered, so delivery is at-least-once. Lease
//! renewal keeps running while a batch is in flight.

use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    config::{ProcessorConfig, StartPosition},
    error::{Result, TidewayError},
    observe,
    traits::ChangeFeed,
    types::{Batch, PartitionId, ResumeToken},
};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffStrategy;
use crate::continuation::ContinuationTracker;
use crate::dispatch::{DispatchOutcome, DispatchPool};
use crate::lease::LeaseCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Leased,
    Polling,
    Dispatching,
    Stopped,
}

/// Why a poller stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerExit {
    Shutdown,
    LeaseLost,
    StaleToken,
    PartitionRemoved,
    Failed(String),
}

pub struct PartitionPoller {
    partition_id: PartitionId,
    config: Arc<ProcessorConfig>,
    feed: Arc<dyn ChangeFeed>,
    tracker: ContinuationTracker,
    leases: Arc<LeaseCoordinator>,
    pool: Arc<DispatchPool>,
    backoff: BackoffStrategy,
    state: watch::Sender<PollerState>,
}

impl PartitionPoller {
    pub fn new(
        partition_id: impl Into<PartitionId>,
        config: Arc<ProcessorConfig>,
        feed: Arc<dyn ChangeFeed>,
        tracker: ContinuationTracker,
        leases: Arc<LeaseCoordinator>,
        pool: Arc<DispatchPool>,
    ) -> Self {
        let (state, _) = watch::channel(PollerState::Idle);
        let backoff = BackoffStrategy::from_config(&config.dispatch);
        Self {
            partition_id: partition_id.into(),
            config,
            feed,
            tracker,
            leases,
            pool,
            backoff,
            state,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Observe state transitions of this poller
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Poll until the lease is lost, the partition disappears, or `shutdown`
    /// turns true
    ///
    /// On a graceful exit the lease is released so a peer can take over
    /// without waiting for expiry.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> PollerExit {
        self.set_state(PollerState::Leased);
        info!(partition_id = %self.partition_id, "Poller started");

        let exit = self.poll_loop(&mut shutdown).await;

        match exit {
            PollerExit::LeaseLost | PollerExit::StaleToken => {
                self.leases.forget(&self.partition_id);
            }
            _ => {
                if let Err(e) = self.leases.release(&self.partition_id).await {
                    warn!(partition_id = %self.partition_id, error = %e, "Failed to release lease");
                }
            }
        }

        self.set_state(PollerState::Stopped);
        info!(partition_id = %self.partition_id, ?exit, "Poller stopped");
        exit
    }

    async fn poll_loop(&self, shutdown: &mut watch::Receiver<bool>) -> PollerExit {
        let renew_every = self.config.lease_renew_interval();
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut position = match self.start_position().await {
            Ok(position) => position,
            Err(e) => return PollerExit::Failed(e.to_string()),
        };
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return PollerExit::Shutdown;
            }

            self.set_state(PollerState::Polling);
            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => return PollerExit::Shutdown,
                _ = renew.tick() => {
                    if !self.leases.renew(&self.partition_id).await {
                        return PollerExit::LeaseLost;
                    }
                    continue;
                }
                page = self.feed.fetch_changes(&self.partition_id, position, self.config.page_size) => page,
            };

            let page = match fetched {
                Ok(page) => {
                    failures = 0;
                    page
                }
                Err(TidewayError::NotFound(_)) => return PollerExit::PartitionRemoved,
                Err(e) => {
                    let delay = self.backoff.calculate(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        partition_id = %self.partition_id,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                    self.set_state(PollerState::Leased);
                    if let Some(exit) = self.pause(delay, &mut renew, shutdown).await {
                        return exit;
                    }
                    continue;
                }
            };

            if page.batch.is_empty() {
                self.set_state(PollerState::Leased);
                if let Some(exit) = self.pause(self.config.poll_interval(), &mut renew, shutdown).await {
                    return exit;
                }
                continue;
            }

            let Some(last_token) = page.batch.last_token() else {
                continue;
            };
            observe::record_batch_fetched(&self.partition_id, page.batch.len());
            debug!(
                partition_id = %self.partition_id,
                records = page.batch.len(),
                first = ?page.batch.first_token(),
                last = %last_token,
                "Fetched batch"
            );

            self.set_state(PollerState::Dispatching);
            let outcome = match self.dispatch(page.batch, &mut renew).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return PollerExit::LeaseLost,
                Err(e) => return PollerExit::Failed(e.to_string()),
            };

            if let DispatchOutcome::DeadLettered { attempts } = outcome {
                warn!(
                    partition_id = %self.partition_id,
                    token = %last_token,
                    attempts,
                    "Advancing past dead-lettered batch"
                );
            }

            match self.advance(last_token, &mut renew, shutdown).await {
                Ok(()) => position = Some(last_token),
                Err(exit) => return exit,
            }
            self.set_state(PollerState::Leased);
        }
    }

    /// Where to read from when the lease is first taken
    async fn start_position(&self) -> Result<Option<ResumeToken>> {
        if let Some(token) = self.tracker.get(&self.partition_id).await? {
            return Ok(Some(token));
        }
        match self.config.start_from {
            StartPosition::Beginning => Ok(None),
            StartPosition::Now => self.feed.latest_token(&self.partition_id).await,
        }
    }

    /// Submit and wait for the outcome, renewing the lease meanwhile
    ///
    /// `Ok(None)` means the lease was lost and the batch abandoned.
    async fn dispatch(
        &self,
        batch: Batch,
        renew: &mut Interval,
    ) -> Result<Option<DispatchOutcome>> {
        let submit = self.pool.submit(batch);
        tokio::pin!(submit);
        let completion = loop {
            tokio::select! {
                res = &mut submit => break res?,
                _ = renew.tick() => {
                    if !self.leases.renew(&self.partition_id).await {
                        return Ok(None);
                    }
                }
            }
        };

        tokio::pin!(completion);
        loop {
            tokio::select! {
                res = &mut completion => return res.map(Some),
                _ = renew.tick() => {
                    if !self.leases.renew(&self.partition_id).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Advance the tracker, retrying transient store errors
    async fn advance(
        &self,
        token: ResumeToken,
        renew: &mut Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), PollerExit> {
        let mut attempt = 0;
        loop {
            match self.tracker.advance(&self.partition_id, token).await {
                Ok(()) => return Ok(()),
                Err(TidewayError::StaleToken { current, .. }) => {
                    error!(
                        partition_id = %self.partition_id,
                        stored = %current,
                        attempted = %token,
                        "Partition advanced by another owner"
                    );
                    return Err(PollerExit::StaleToken);
                }
                Err(e) => {
                    let delay = self.backoff.calculate(attempt);
                    attempt += 1;
                    warn!(partition_id = %self.partition_id, error = %e, attempt, "Token advance failed, retrying");
                    // Shutdown during this wait gives up the advance; the batch
                    // is redelivered to the next owner.
                    if let Some(exit) = self.pause(delay, renew, shutdown).await {
                        return Err(exit);
                    }
                }
            }
        }
    }

    /// Sleep for `delay` while still renewing and watching for shutdown
    async fn pause(
        &self,
        delay: Duration,
        renew: &mut Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<PollerExit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Some(PollerExit::Shutdown),
                _ = renew.tick() => {
                    if !self.leases.renew(&self.partition_id).await {
                        return Some(PollerExit::LeaseLost);
                    }
                }
                _ = &mut sleep => return None,
            }
        }
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::memory::InMemoryStore;
    use parking_lot::Mutex;
    use tideway_core::traits::{ContinuationStore, LeaseStore};
    use tideway_core::config::DispatchConfig;

    struct Fixture {
        store: Arc<InMemoryStore>,
        leases: Arc<LeaseCoordinator>,
        pool: Arc<DispatchPool>,
        config: Arc<ProcessorConfig>,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    fn fixture(config: ProcessorConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::with_partitions(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |batch: Batch| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .extend(batch.records.iter().map(|r| r.token.value()));
                Ok(())
            }
        });
        let pool = Arc::new(
            DispatchPool::start(&config.dispatch, Arc::new(handler), store.clone()).unwrap(),
        );
        let leases = Arc::new(LeaseCoordinator::new(
            "host-a",
            config.lease_expiration(),
            store.clone(),
            store.clone(),
        ));
        Fixture {
            store,
            leases,
            pool,
            config: Arc::new(config),
            seen,
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::new("host-a")
            .with_page_size(4)
            .with_poll_interval(Duration::from_millis(5))
            .with_lease_renew_interval(Duration::from_millis(20))
            .with_dispatch(DispatchConfig::new().with_backoff_ms(1, 5))
    }

    impl Fixture {
        fn poller(&self) -> PartitionPoller {
            PartitionPoller::new(
                "p0",
                self.config.clone(),
                self.store.clone(),
                ContinuationTracker::new(self.store.clone()),
                self.leases.clone(),
                self.pool.clone(),
            )
        }
    }

    async fn wait_for_token(store: &InMemoryStore, token: u64) {
        for _ in 0..400 {
            if let Ok(Some((t, _))) = ContinuationStore::load(store, "p0").await {
                if t.value() >= token {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("token {token} never reached");
    }

    #[tokio::test]
    async fn test_polls_in_order_and_releases_on_shutdown() {
        let fx = fixture(fast_config());
        for i in 0..10u8 {
            fx.store.push("p0", vec![i]);
        }
        assert!(fx.leases.try_acquire("p0", Duration::from_secs(60)).await.unwrap());

        let (tx, rx) = watch::channel(false);
        let poller = fx.poller();
        let state = poller.subscribe();
        let handle = tokio::spawn(poller.run(rx));

        wait_for_token(&fx.store, 10).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), PollerExit::Shutdown);

        assert_eq!(*fx.seen.lock(), (1..=10).collect::<Vec<_>>());
        assert_eq!(*state.borrow(), PollerState::Stopped);
        let lease = LeaseStore::get(fx.store.as_ref(), "p0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.owner_id, None);
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let fx = fixture(fast_config());
        fx.store.push("p0", b"x".to_vec());
        fx.store.fail_next_fetches(3);
        fx.leases.try_acquire("p0", Duration::from_secs(60)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fx.poller().run(rx));
        wait_for_token(&fx.store, 1).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), PollerExit::Shutdown);
        assert_eq!(*fx.seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_stops_when_lease_is_stolen() {
        let fx = fixture(fast_config());
        fx.leases.try_acquire("p0", Duration::from_secs(60)).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fx.poller().run(rx));

        let current = LeaseStore::get(fx.store.as_ref(), "p0")
            .await
            .unwrap()
            .unwrap();
        fx.store.force_lease(current.claimed_by(
            "host-b",
            chrono::Utc::now(),
            Duration::from_secs(60),
        ));

        assert_eq!(handle.await.unwrap(), PollerExit::LeaseLost);
        assert!(!fx.leases.is_owned("p0"));
        // The stopped poller must not clear the new owner's lease.
        let lease = LeaseStore::get(fx.store.as_ref(), "p0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.owner_id.as_deref(), Some("host-b"));
    }

    #[tokio::test]
    async fn test_start_from_now_skips_backlog() {
        let fx = fixture(fast_config().with_start_from(StartPosition::Now));
        for i in 0..3u8 {
            fx.store.push("p0", vec![i]);
        }
        fx.leases.try_acquire("p0", Duration::from_secs(60)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fx.poller().run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        fx.store.push("p0", b"new".to_vec());

        wait_for_token(&fx.store, 4).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(*fx.seen.lock(), vec![4]);
    }

    #[tokio::test]
    async fn test_removed_partition_stops_poller() {
        let fx = fixture(fast_config());
        fx.leases.try_acquire("p0", Duration::from_secs(60)).await.unwrap();
        fx.store.remove_partition("p0");

        let (_tx, rx) = watch::channel(false);
        assert_eq!(fx.poller().run(rx).await, PollerExit::PartitionRemoved);
        assert!(!fx.leases.is_owned("p0"));
    }
}
