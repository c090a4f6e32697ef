//! Forward command implementation

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tideway::prelude::*;
use tideway_sqlite::SqliteStore;

pub async fn execute(
    store: Arc<SqliteStore>,
    config: ProcessorConfig,
    url: &str,
    timeout_ms: u64,
) -> Result<()> {
    let sink = HttpSink::new(url, Duration::from_millis(timeout_ms))
        .context("Failed to create HTTP sink")?;
    println!("Forwarding batches to {}", sink.url());

    let handler = Arc::new(ForwardingHandler::new(Arc::new(sink)));
    super::run_until_stopped(store, config, handler).await
}
