//! Optional metrics instrumentation for Tideway.
//!
//! When the `observe` feature is enabled, the pipeline emits counters,
//! histograms, and gauges via the [`metrics`] crate. The embedding application
//! must install a metrics recorder to collect them.
//!
//! Without the feature every function in this module is a zero-cost no-op.

/// Record a non-empty fetch from a partition.
///
/// - `tideway.poller.batches_fetched_total` – counter with `partition` label
/// - `tideway.poller.records_fetched_total` – counter with `partition` label
#[inline]
pub fn record_batch_fetched(partition_id: &str, records: usize) {
    #[cfg(feature = "observe")]
    {
        let partition = partition_id.to_string();
        metrics::counter!("tideway.poller.batches_fetched_total", "partition" => partition.clone())
            .increment(1);
        metrics::counter!("tideway.poller.records_fetched_total", "partition" => partition)
            .increment(records as u64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (partition_id, records);
    }
}

/// Record the outcome of one batch dispatch.
///
/// - `tideway.dispatch.batches_total` – counter with `outcome` label (`applied` / `dead_lettered`)
/// - `tideway.dispatch.duration_seconds` – histogram, submit to completion
#[inline]
pub fn record_dispatch(duration: std::time::Duration, applied: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if applied { "applied" } else { "dead_lettered" };
        metrics::counter!("tideway.dispatch.batches_total", "outcome" => outcome).increment(1);
        metrics::histogram!("tideway.dispatch.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, applied);
    }
}

/// Record a failed handler attempt that will be retried.
///
/// - `tideway.dispatch.retries_total` – counter
#[inline]
pub fn record_dispatch_retry() {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tideway.dispatch.retries_total").increment(1);
    }
}

/// Record a batch routed to the dead-letter sink.
///
/// - `tideway.dead_letters_total` – counter
#[inline]
pub fn record_dead_letter(partition_id: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tideway.dead_letters_total", "partition" => partition_id.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = partition_id;
    }
}

/// Lease lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquired,
    Stolen,
    Lost,
    Released,
}

impl LeaseEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseEvent::Acquired => "acquired",
            LeaseEvent::Stolen => "stolen",
            LeaseEvent::Lost => "lost",
            LeaseEvent::Released => "released",
        }
    }
}

/// Record a lease transition.
///
/// - `tideway.lease.events_total` – counter with `event` label
#[inline]
pub fn record_lease_event(event: LeaseEvent) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tideway.lease.events_total", "event" => event.as_str()).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = event;
    }
}

/// Set the number of partitions this process currently owns.
///
/// - `tideway.lease.owned_partitions` – gauge
#[inline]
pub fn set_owned_partitions(count: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("tideway.lease.owned_partitions").set(count as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = count;
    }
}

/// Record a resume token advance.
///
/// - `tideway.continuation.advances_total` – counter with `partition` label
#[inline]
pub fn record_token_advance(partition_id: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tideway.continuation.advances_total", "partition" => partition_id.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = partition_id;
    }
}

/// Record an optimistic concurrency conflict.
///
/// - `tideway.cas.conflicts_total` – counter with `target` label (`view` / `continuation`)
#[inline]
pub fn record_cas_conflict(target: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tideway.cas.conflicts_total", "target" => target).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = target;
    }
}
