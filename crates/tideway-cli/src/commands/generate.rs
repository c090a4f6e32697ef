//! Generate command implementation

use anyhow::{Context, Result};
use tideway::DataGenerator;
use tideway_sqlite::SqliteStore;

pub async fn execute(store: &SqliteStore, scenarios: usize, partitions: usize) -> Result<()> {
    anyhow::ensure!(partitions > 0, "at least one partition is required");

    for p in 0..partitions {
        store
            .create_partition(&format!("p{}", p))
            .await
            .context("Failed to create partition")?;
    }

    let mut generator = DataGenerator::new(partitions);
    let appended = generator
        .generate(store, scenarios)
        .await
        .context("Failed to append generated actions")?;

    println!(
        "✓ Appended {} action(s) from {} scenario(s) across {} partition(s)",
        appended, scenarios, partitions
    );
    Ok(())
}
