pub mod consume;
pub mod copy;
pub mod dead_letters;
pub mod forward;
pub mod generate;
pub mod status;

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tideway::prelude::*;
use tideway_sqlite::SqliteStore;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Flags shared by every command that runs a processor
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Owner id used for leases (overrides the config file). Defaults to
    /// `<hostname>-<random>`, unique per process.
    #[arg(long, env = "TIDEWAY_HOST")]
    pub host: Option<String>,

    /// Records per fetched batch
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Dispatch workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Start a partition without a stored token from its current end
    #[arg(long)]
    pub from_now: bool,
}

/// Load the processor config file, if any, and apply flag overrides
pub fn load_config(path: Option<&Path>, args: &RunArgs) -> Result<ProcessorConfig> {
    let mut config = match path {
        Some(path) => ProcessorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ProcessorConfig::default(),
    };

    if let Some(host) = &args.host {
        config = config.with_host_name(host.clone());
    }
    if let Some(page_size) = args.page_size {
        config = config.with_page_size(page_size);
    }
    if let Some(workers) = args.workers {
        config.dispatch = config.dispatch.with_worker_count(workers);
    }
    if args.from_now {
        config = config.with_start_from(StartPosition::Now);
    }

    config.validate().context("Invalid processor configuration")?;
    Ok(config)
}

/// Run a processor over `store` until a line is read from stdin or Ctrl-C
pub async fn run_until_stopped(
    store: Arc<SqliteStore>,
    config: ProcessorConfig,
    handler: Arc<dyn BatchHandler>,
) -> Result<()> {
    let host = config.host_name.clone();
    let running = ChangeFeedProcessorBuilder::new(config)
        .with_store(store)
        .with_shared_handler(handler)
        .build()
        .context("Failed to build processor")?
        .start()
        .context("Failed to start processor")?;

    println!("Processor {} running. Press Enter or Ctrl+C to stop.", host);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut report = tokio::time::interval(Duration::from_secs(10));
    report.tick().await;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if stdin_open => {
                // A closed stdin (e.g. running detached) is not a stop request.
                match line {
                    Ok(Some(_)) => break,
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = report.tick() => {
                let stats = running.stats();
                tracing::info!(
                    owned = ?stats.owned_partitions,
                    applied = stats.dispatch.applied,
                    dead_lettered = stats.dispatch.dead_lettered,
                    "Processor progress"
                );
            }
        }
    }

    println!("Stopping processor {}...", host);
    let stats = running.stats();
    running.stop().await.context("Processor did not shut down cleanly")?;
    println!(
        "✓ Stopped: {} batch(es) applied, {} dead-lettered",
        stats.dispatch.applied, stats.dispatch.dead_lettered
    );
    Ok(())
}
