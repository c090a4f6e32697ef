//! Tideway CLI - generate change data, run consumers and inspect progress

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tideway_core::SqliteConfig;
use tideway_sqlite::SqliteStore;

mod commands;

#[derive(Parser)]
#[command(name = "tideway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the SQLite database shared by all consumers
    #[arg(short, long, default_value = "./tideway.db", env = "TIDEWAY_DB")]
    db_path: PathBuf,

    /// Processor configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append random shopping-cart actions to the change feed
    Generate {
        /// Number of cart scenarios to generate
        #[arg(short, long, default_value_t = 100)]
        scenarios: usize,

        /// Number of feed partitions
        #[arg(short, long, default_value_t = 4)]
        partitions: usize,
    },

    /// Materialize sales per state until a line is entered or Ctrl-C
    Consume {
        #[command(flatten)]
        run: commands::RunArgs,
    },

    /// Post every batch to an HTTP endpoint
    Forward {
        /// Endpoint receiving batches as JSON
        #[arg(short, long)]
        url: String,

        /// Request timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,

        #[command(flatten)]
        run: commands::RunArgs,
    },

    /// Copy every record into another database's change feed
    Copy {
        /// Destination database path
        #[arg(long)]
        dest: PathBuf,

        #[command(flatten)]
        run: commands::RunArgs,
    },

    /// Partition ownership, tokens, lag and materialized views
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dead letter management
    #[command(subcommand)]
    DeadLetters(DeadLetterCommands),
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List the most recent dead letters
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Remove one dead letter by id
    Remove { id: i64 },

    /// Remove all dead letters
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let store = Arc::new(
        SqliteStore::open(SqliteConfig::new(&cli.db_path))
            .with_context(|| format!("Failed to open database {}", cli.db_path.display()))?,
    );

    match cli.command {
        Commands::Generate {
            scenarios,
            partitions,
        } => {
            commands::generate::execute(&store, scenarios, partitions).await?;
        }
        Commands::Consume { run } => {
            let config = commands::load_config(cli.config.as_deref(), &run)?;
            commands::consume::execute(store, config).await?;
        }
        Commands::Forward {
            url,
            timeout_ms,
            run,
        } => {
            let config = commands::load_config(cli.config.as_deref(), &run)?;
            commands::forward::execute(store, config, &url, timeout_ms).await?;
        }
        Commands::Copy { dest, run } => {
            let config = commands::load_config(cli.config.as_deref(), &run)?;
            commands::copy::execute(store, config, dest).await?;
        }
        Commands::Status { json } => {
            commands::status::execute(&store, &cli.db_path, json).await?;
        }
        Commands::DeadLetters(cmd) => match cmd {
            DeadLetterCommands::List { limit } => {
                commands::dead_letters::list(&store, limit).await?;
            }
            DeadLetterCommands::Remove { id } => {
                commands::dead_letters::remove(&store, id).await?;
            }
            DeadLetterCommands::Clear { force } => {
                commands::dead_letters::clear(&store, force).await?;
            }
        },
    }

    Ok(())
}
