//! Bounded dispatch pool
//!
//! Pollers submit fetched batches; a fixed set of workers applies the user
//! handler. The queue is bounded, so a slow handler pushes back on pollers
//! instead of letting batches pile up in memory.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tideway_core::{
    config::DispatchConfig,
    error::{Result, TidewayError},
    observe,
    traits::DeadLetterSink,
    types::{Batch, DeadLetter},
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backoff::BackoffStrategy;
use crate::handler::BatchHandler;

/// Final result of dispatching one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded
    Applied { attempts: u32 },
    /// Every attempt failed; the batch went to the dead-letter sink
    DeadLettered { attempts: u32 },
}

impl DispatchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Applied { attempts } | DispatchOutcome::DeadLettered { attempts } => {
                *attempts
            }
        }
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub submitted: AtomicU64,
    pub applied: AtomicU64,
    pub retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub panics: AtomicU64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub submitted: u64,
    pub applied: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub panics: u64,
}

impl DispatchMetricsSnapshot {
    /// Batches accepted but not yet completed
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.applied + self.dead_lettered)
    }
}

/// Resolves once a submitted batch is applied or dead-lettered
pub struct Completion {
    rx: oneshot::Receiver<DispatchOutcome>,
}

impl Future for Completion {
    type Output = Result<DispatchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.map_err(|_| {
                TidewayError::InvalidState("dispatch worker dropped the batch".to_string())
            })
        })
    }
}

struct Job {
    batch: Batch,
    reply: oneshot::Sender<DispatchOutcome>,
    submitted_at: Instant,
}

struct Worker {
    handler: Arc<dyn BatchHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    backoff: BackoffStrategy,
    max_attempts: u32,
    metrics: Arc<DispatchMetrics>,
}

pub struct DispatchPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<DispatchMetrics>,
    capacity: usize,
}

impl DispatchPool {
    /// Spawn `config.worker_count` workers on the current runtime
    pub fn start(
        config: &DispatchConfig,
        handler: Arc<dyn BatchHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        Self::start_with_backoff(
            config,
            BackoffStrategy::from_config(config),
            handler,
            dead_letters,
        )
    }

    pub fn start_with_backoff(
        config: &DispatchConfig,
        backoff: BackoffStrategy,
        handler: Arc<dyn BatchHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let metrics = Arc::new(DispatchMetrics::default());
        let worker = Arc::new(Worker {
            handler,
            dead_letters,
            backoff,
            max_attempts: config.max_attempts,
            metrics: metrics.clone(),
        });

        let workers = (0..config.worker_count)
            .map(|id| {
                let rx = rx.clone();
                let worker = worker.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => worker.process(job).await,
                            None => break,
                        }
                    }
                    debug!(worker = id, "Dispatch worker exited");
                })
            })
            .collect();

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            metrics,
            capacity: config.queue_capacity,
        })
    }

    /// Enqueue a batch, waiting for queue space
    ///
    /// The returned [`Completion`] resolves when the batch was applied or
    /// dead-lettered.
    pub async fn submit(&self, batch: Batch) -> Result<Completion> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| TidewayError::InvalidState("dispatch pool is shut down".to_string()))?;

        let (reply, rx) = oneshot::channel();
        let job = Job {
            batch,
            reply,
            submitted_at: Instant::now(),
        };
        sender
            .send(job)
            .await
            .map_err(|_| TidewayError::InvalidState("dispatch pool is shut down".to_string()))?;
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        Ok(Completion { rx })
    }

    /// Batches waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| self.capacity - tx.capacity())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting batches and wait for queued ones to finish
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Dispatch worker terminated abnormally");
                }
            }
        }
    }

    /// Abort workers immediately, dropping in-flight batches
    pub fn abort(&self) {
        drop(self.sender.lock().take());
        for handle in self.workers.lock().iter() {
            handle.abort();
        }
    }
}

impl Worker {
    async fn process(&self, job: Job) {
        let Job {
            batch,
            reply,
            submitted_at,
        } = job;

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = AssertUnwindSafe(self.handler.handle(&batch))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(())) => {
                    self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                    break DispatchOutcome::Applied { attempts: attempt };
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => {
                    self.metrics.panics.fetch_add(1, Ordering::Relaxed);
                    format!("handler panicked: {}", panic_message(panic.as_ref()))
                }
            };

            if attempt >= self.max_attempts {
                self.dead_letter(&batch, failure, attempt).await;
                break DispatchOutcome::DeadLettered { attempts: attempt };
            }

            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            observe::record_dispatch_retry();
            let delay = self.backoff.calculate(attempt - 1);
            warn!(
                partition_id = %batch.partition_id,
                handler = self.handler.name(),
                attempt,
                error = %failure,
                delay_ms = delay.as_millis() as u64,
                "Handler failed, retrying batch"
            );
            tokio::time::sleep(delay).await;
        };

        observe::record_dispatch(
            submitted_at.elapsed(),
            matches!(outcome, DispatchOutcome::Applied { .. }),
        );
        debug!(
            partition_id = %batch.partition_id,
            records = batch.len(),
            ?outcome,
            "Batch dispatched"
        );
        // The poller may have given up on the batch (lease lost).
        let _ = reply.send(outcome);
    }

    async fn dead_letter(&self, batch: &Batch, failure: String, attempts: u32) {
        let err = TidewayError::handler(attempts, failure);
        error!(
            partition_id = %batch.partition_id,
            first_token = ?batch.first_token(),
            last_token = ?batch.last_token(),
            attempts,
            error = %err,
            "Batch exhausted its attempts, dead-lettering"
        );

        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        observe::record_dead_letter(&batch.partition_id);
        let dead_letter = DeadLetter::from_batch(batch, err.to_string(), attempts);
        if let Err(e) = self.dead_letters.send(dead_letter).await {
            error!(
                partition_id = %batch.partition_id,
                error = %e,
                "Dead-letter sink rejected batch"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::memory::InMemoryStore;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tideway_core::types::{ChangeRecord, ResumeToken};

    fn batch(token: u64) -> Batch {
        Batch::new(
            "p0",
            vec![ChangeRecord::new("p0", ResumeToken::new(token), vec![])],
        )
    }

    fn fast(config: DispatchConfig) -> DispatchConfig {
        config.with_backoff_ms(1, 5)
    }

    #[tokio::test]
    async fn test_applied_on_first_attempt() {
        let sink = Arc::new(InMemoryStore::new());
        let pool = DispatchPool::start(
            &fast(DispatchConfig::new()),
            Arc::new(handler_fn(|_b: Batch| async { Ok(()) })),
            sink.clone(),
        )
        .unwrap();

        let outcome = pool.submit(batch(1)).await.unwrap().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied { attempts: 1 });
        pool.shutdown().await;
        assert_eq!(pool.metrics().applied, 1);
        assert!(sink.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_b: Batch| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TidewayError::Transient("flaky".into()))
                } else {
                    Ok(())
                }
            }
        });
        let pool = DispatchPool::start(
            &fast(DispatchConfig::new()),
            Arc::new(handler),
            Arc::new(InMemoryStore::new()),
        )
        .unwrap();

        let outcome = pool.submit(batch(1)).await.unwrap().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied { attempts: 3 });
        assert_eq!(pool.metrics().retries, 2);
    }

    #[tokio::test]
    async fn test_panics_are_caught_and_dead_lettered() {
        let sink = Arc::new(InMemoryStore::new());
        let handler = handler_fn(|b: Batch| async move {
            assert!(b.is_empty(), "boom");
            Ok(())
        });
        let pool = DispatchPool::start(
            &fast(DispatchConfig::new().with_max_attempts(2)),
            Arc::new(handler),
            sink.clone(),
        )
        .unwrap();

        let outcome = pool.submit(batch(7)).await.unwrap().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempts: 2 });

        let dead = sink.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_token, Some(ResumeToken::new(7)));
        assert!(dead[0].error.contains("boom"));
        assert_eq!(pool.metrics().panics, 2);

        // The pool keeps working after a panic.
        let outcome = pool.submit(batch(8)).await.unwrap().await.unwrap();
        assert_eq!(outcome.attempts(), 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = DispatchPool::start(
            &DispatchConfig::new(),
            Arc::new(handler_fn(|_b: Batch| async { Ok(()) })),
            Arc::new(InMemoryStore::new()),
        )
        .unwrap();
        pool.shutdown().await;
        assert!(pool.submit(batch(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let done = Arc::new(AtomicU32::new(0));
        let counter = done.clone();
        let handler = handler_fn(move |_b: Batch| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let pool = DispatchPool::start(
            &DispatchConfig::new().with_worker_count(1).with_queue_capacity(8),
            Arc::new(handler),
            Arc::new(InMemoryStore::new()),
        )
        .unwrap();

        let mut completions = Vec::new();
        for t in 1..=5 {
            completions.push(pool.submit(batch(t)).await.unwrap());
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        for c in completions {
            assert!(matches!(c.await.unwrap(), DispatchOutcome::Applied { .. }));
        }
    }
}
