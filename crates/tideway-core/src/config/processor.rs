use crate::error::{Result, TidewayError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Where a partition without a stored token starts reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Replay the partition from its first record
    #[default]
    Beginning,
    /// Skip everything already in the partition when the lease is taken
    Now,
}

/// Configuration for the change-feed processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Owner id written into leases. Must be unique per running consumer.
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Maximum records per fetched batch
    /// Default: 100
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Sleep after an empty fetch (milliseconds)
    /// Default: 500
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lease time-to-live (milliseconds)
    /// Default: 60000
    #[serde(default = "default_lease_expiration_ms")]
    pub lease_expiration_ms: u64,

    /// How often an owner renews each held lease (milliseconds)
    /// Default: 17000
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// Period of the scan-and-reconcile pass (milliseconds)
    /// Default: 13000
    #[serde(default = "default_lease_acquire_interval_ms")]
    pub lease_acquire_interval_ms: u64,

    /// First-run policy for partitions without a stored token
    #[serde(default)]
    pub start_from: StartPosition,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Upper bound on graceful shutdown before remaining tasks are aborted
    /// (milliseconds)
    /// Default: 30000
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Configuration for the dispatch worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of concurrent handler invocations
    /// Default: 5
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Batches waiting for a worker before `submit` blocks
    /// Default: 16
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Handler attempts per batch before it is dead-lettered
    /// Default: 5
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds), doubled per attempt
    /// Default: 100
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap on the retry delay (milliseconds)
    /// Default: 10000
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// `<hostname>-<random suffix>`, distinct for every process
///
/// Lease ownership is keyed by this id, so two processes sharing it would
/// both believe they own the same partitions.
fn default_host_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "host".to_string());
    format!("{}-{}", host, Uuid::new_v4().simple())
}

fn default_page_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_expiration_ms() -> u64 {
    60_000
}

fn default_lease_renew_interval_ms() -> u64 {
    17_000
}

fn default_lease_acquire_interval_ms() -> u64 {
    13_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_worker_count() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    16
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff_ms(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff_initial_ms = initial_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(TidewayError::Config(
                "dispatch.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TidewayError::Config(
                "dispatch.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(TidewayError::Config(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(TidewayError::Config(format!(
                "dispatch.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            page_size: default_page_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_expiration_ms: default_lease_expiration_ms(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            lease_acquire_interval_ms: default_lease_acquire_interval_ms(),
            start_from: StartPosition::default(),
            dispatch: DispatchConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ProcessorConfig {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lease_expiration(mut self, ttl: Duration) -> Self {
        self.lease_expiration_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_start_from(mut self, start: StartPosition) -> Self {
        self.start_from = start;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_expiration(&self) -> Duration {
        Duration::from_millis(self.lease_expiration_ms)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn lease_acquire_interval(&self) -> Duration {
        Duration::from_millis(self.lease_acquire_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(TidewayError::Config("host_name must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(TidewayError::Config("page_size must be at least 1".to_string()));
        }
        if self.lease_renew_interval_ms == 0 || self.lease_acquire_interval_ms == 0 {
            return Err(TidewayError::Config(
                "lease intervals must be non-zero".to_string(),
            ));
        }
        // Renewal has to land before the lease lapses, or owners lose every lease.
        if self.lease_renew_interval_ms >= self.lease_expiration_ms {
            return Err(TidewayError::Config(format!(
                "lease_renew_interval_ms ({}) must be less than lease_expiration_ms ({})",
                self.lease_renew_interval_ms, self.lease_expiration_ms
            )));
        }
        self.dispatch.validate()
    }
}
