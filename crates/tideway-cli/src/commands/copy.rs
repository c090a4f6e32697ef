//! Copy command implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tideway::prelude::*;
use tideway_core::SqliteConfig;
use tideway_sqlite::SqliteStore;

pub async fn execute(store: Arc<SqliteStore>, config: ProcessorConfig, dest: PathBuf) -> Result<()> {
    let destination = Arc::new(
        SqliteStore::open(SqliteConfig::new(&dest))
            .with_context(|| format!("Failed to open destination {}", dest.display()))?,
    );
    println!("Copying records into {}", dest.display());

    let handler = Arc::new(CopyHandler::new(destination));
    super::run_until_stopped(store, config, handler).await
}
