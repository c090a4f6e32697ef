//! Dead letter command implementations

use anyhow::{Context, Result};
use std::io::{self, Write};
use tideway_sqlite::SqliteStore;

pub async fn list(store: &SqliteStore, limit: usize) -> Result<()> {
    let entries = store
        .list_dead_letters(limit)
        .await
        .context("Failed to list dead letters")?;
    let total = store.count_dead_letters().await?;

    if entries.is_empty() {
        println!("No dead letters");
        return Ok(());
    }

    println!("Dead letters ({} of {}):", entries.len(), total);
    for entry in entries {
        let dl = &entry.dead_letter;
        let range = match (dl.first_token, dl.last_token) {
            (Some(first), Some(last)) => format!("{}..={}", first, last),
            _ => "-".to_string(),
        };
        println!(
            "  #{:<5} {} {:<8} tokens {:<10} attempts={} records={}",
            entry.id,
            dl.failed_at.format("%Y-%m-%d %H:%M:%S"),
            dl.partition_id,
            range,
            dl.attempts,
            dl.records.len()
        );
        println!("         {}", dl.error);
    }
    Ok(())
}

pub async fn remove(store: &SqliteStore, id: i64) -> Result<()> {
    if store.remove_dead_letter(id).await? {
        println!("✓ Removed dead letter #{}", id);
    } else {
        println!("Dead letter #{} not found", id);
    }
    Ok(())
}

pub async fn clear(store: &SqliteStore, force: bool) -> Result<()> {
    let count = store.count_dead_letters().await?;
    if count == 0 {
        println!("No dead letters");
        return Ok(());
    }

    if !force {
        print!("Remove {} dead letter(s)? [y/N] ", count);
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    let removed = store
        .clear_dead_letters()
        .await
        .context("Failed to clear dead letters")?;
    println!("✓ Removed {} dead letter(s)", removed);
    Ok(())
}
