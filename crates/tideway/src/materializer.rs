use futures::future::try_join_all;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    error::Result,
    observe,
    traits::ViewStore,
    types::{AggregateView, Delta},
};
use tracing::{trace, warn};

use crate::backoff::BackoffStrategy;

/// Transient store errors tolerated per `apply` before giving up
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 5;

/// Folds deltas into keyed aggregate views with conditional writes
///
/// Concurrent writers on the same key (other workers, other processes) make
/// the write fail its precondition; the whole read-modify-write cycle is then
/// retried after a short jittered delay. Conflicts never reach the caller.
/// Transient store errors are retried with backoff up to a ceiling. Replays
/// are not deduplicated: applying the same delta twice counts it twice.
pub struct Materializer {
    views: Arc<dyn ViewStore>,
    backoff: BackoffStrategy,
    transient_retries: u32,
    conflicts: AtomicU64,
}

impl Materializer {
    pub fn new(views: Arc<dyn ViewStore>) -> Self {
        Self {
            views,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_millis(2),
                max: Duration::from_millis(200),
            },
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
            conflicts: AtomicU64::new(0),
        }
    }

    /// Delay schedule for conflicts and transient errors
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    /// Add `delta` to the view at `key`, creating it on first write
    pub async fn apply(&self, key: &str, delta: Delta) -> Result<AggregateView> {
        let mut conflicts: u32 = 0;
        let mut transient: u32 = 0;
        loop {
            match self.try_apply(key, delta).await {
                Ok(view) => return Ok(view),
                Err(e) if e.is_precondition_failed() => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    observe::record_cas_conflict("view");
                    trace!(key, conflicts, "View write conflict, retrying");
                    let delay = jitter(self.backoff.calculate(conflicts));
                    conflicts = conflicts.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() && transient < self.transient_retries => {
                    let delay = self.backoff.calculate(transient);
                    transient += 1;
                    warn!(
                        key,
                        attempt = transient,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "View write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_apply(&self, key: &str, delta: Delta) -> Result<AggregateView> {
        let current = self
            .views
            .read(key)
            .await?
            .unwrap_or_else(|| AggregateView::empty(key));
        let expected = current.version_tag;
        let mut next = current.with_delta(delta);
        next.version_tag = Some(self.views.write(&next, expected).await?);
        Ok(next)
    }

    /// Apply one delta per key; keys are written concurrently
    pub async fn apply_batch<I>(&self, deltas: I) -> Result<Vec<AggregateView>>
    where
        I: IntoIterator<Item = (String, Delta)>,
    {
        let writes = deltas
            .into_iter()
            .filter(|(_, delta)| !delta.is_empty())
            .map(|(key, delta)| async move { self.apply(&key, delta).await });
        try_join_all(writes).await
    }

    pub async fn read(&self, key: &str) -> Result<Option<AggregateView>> {
        self.views.read(key).await
    }

    pub async fn views(&self) -> Result<Vec<AggregateView>> {
        self.views.list().await
    }

    /// Conditional-write conflicts absorbed so far
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

/// Spread retries of writers that collided on the same key
fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn test_apply_creates_then_accumulates() {
        let materializer = Materializer::new(Arc::new(InMemoryStore::new()));

        let view = materializer.apply("CA", Delta::new(1, 10.0)).await.unwrap();
        assert_eq!((view.count, view.total), (1, 10.0));
        assert!(view.version_tag.is_some());

        let view = materializer.apply("CA", Delta::new(2, 5.0)).await.unwrap();
        assert_eq!((view.count, view.total), (3, 15.0));
    }

    #[tokio::test]
    async fn test_concurrent_applies_lose_nothing() {
        let materializer = Arc::new(Materializer::new(Arc::new(InMemoryStore::new())));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let m = materializer.clone();
            handles.push(tokio::spawn(async move {
                m.apply("TX", Delta::new(1, 2.0)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let view = materializer.read("TX").await.unwrap().unwrap();
        assert_eq!(view.count, 50);
        assert_eq!(view.total, 100.0);
    }

    #[tokio::test]
    async fn test_transient_write_error_is_retried() {
        let store = Arc::new(InMemoryStore::new());
        let materializer = Materializer::new(store.clone());
        store.fail_next_view_writes(1);

        let view = materializer.apply("NY", Delta::new(1, 1.0)).await.unwrap();
        assert_eq!((view.count, view.total), (1, 1.0));
        assert_eq!(materializer.read("NY").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_persistent_transient_errors_give_up() {
        let store = Arc::new(InMemoryStore::new());
        let materializer = Materializer::new(store.clone())
            .with_backoff(BackoffStrategy::Fixed(Duration::from_millis(1)))
            .with_transient_retries(2);
        store.fail_next_view_writes(10);

        let err = materializer.apply("NY", Delta::new(1, 1.0)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(materializer.read("NY").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_batch_skips_empty_deltas() {
        let materializer = Materializer::new(Arc::new(InMemoryStore::new()));
        let applied = materializer
            .apply_batch(vec![
                ("CA".to_string(), Delta::new(1, 3.0)),
                ("NY".to_string(), Delta::default()),
                ("WA".to_string(), Delta::new(2, 4.0)),
            ])
            .await
            .unwrap();

        assert_eq!(applied.len(), 2);
        assert!(materializer.read("NY").await.unwrap().is_none());
        assert_eq!(materializer.views().await.unwrap().len(), 2);
    }
}
