//! Consume command implementation

use anyhow::Result;
use std::sync::Arc;
use tideway::prelude::*;
use tideway_sqlite::SqliteStore;

/// Materialize purchases into per-state sales views in the same database
pub async fn execute(store: Arc<SqliteStore>, config: ProcessorConfig) -> Result<()> {
    let materializer = Arc::new(Materializer::new(store.clone()));
    let handler = Arc::new(StateSalesHandler::new(materializer.clone()));

    super::run_until_stopped(store, config, handler).await?;

    if materializer.conflicts() > 0 {
        println!("View write conflicts retried: {}", materializer.conflicts());
    }
    Ok(())
}
