//! Status command implementation

use anyhow::{Context, Result};
use std::path::Path;
use tideway::prelude::*;
use tideway::status;
use tideway_sqlite::SqliteStore;

pub async fn execute(store: &SqliteStore, db_path: &Path, json: bool) -> Result<()> {
    tracing::info!("Checking consumer status: {}", db_path.display());

    let report = status::collect(store, store, store)
        .await
        .context("Failed to collect partition status")?;
    let views = ViewStore::list(store)
        .await
        .context("Failed to list views")?;
    let dead_letters = store
        .count_dead_letters()
        .await
        .context("Failed to count dead letters")?;

    if json {
        let out = serde_json::json!({
            "report": report,
            "views": views,
            "deadLetters": dead_letters,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("\nConsumer Status");
    println!("{}", "=".repeat(60));
    println!("Path: {}", db_path.display());
    println!(
        "Schema Version: {}",
        store.schema_version().context("Failed to get schema version")?
    );

    println!("\nPartitions:");
    for p in &report.partitions {
        let owner = p.owner.as_deref().unwrap_or("-");
        let token = p.token.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        let latest = p
            .latest_token
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<8} owner={:<12} token={:<6} latest={:<6} lag={}",
            p.partition_id, owner, token, latest, p.lag
        );
    }

    let owners = report.owners();
    if !owners.is_empty() {
        println!("\nOwners:");
        for (owner, count) in owners {
            println!("  {}: {} partition(s)", owner, count);
        }
    }

    if !views.is_empty() {
        println!("\nViews:");
        for view in &views {
            println!("  {:<4} count={:<6} total={:.2}", view.key, view.count, view.total);
        }
    }

    if dead_letters > 0 {
        println!("\n⚠️  {} dead letter(s); see 'tideway dead-letters list'", dead_letters);
    }

    let lag = report.total_lag();
    if lag > 0 {
        println!("\n⚠️  Consumer lag: {} record(s) behind", lag);
        println!("Run 'tideway consume' to catch up");
    } else {
        println!("\n✓ All partitions are up to date");
    }

    Ok(())
}
