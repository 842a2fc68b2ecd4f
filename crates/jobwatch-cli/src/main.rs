use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_adapters::{adapter_for_source, load_document, PRIMARY_SOURCE_ID};
use jobwatch_notify::health_message;
use jobwatch_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch-cli")]
#[command(about = "Watch job-listing tables and announce new postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both sources, announce new listings and record them.
    Sync,
    /// Parse a local markdown table and print the listings it contains.
    Parse {
        path: PathBuf,
        #[arg(long, default_value = PRIMARY_SOURCE_ID)]
        source: String,
    },
    /// Post a message to the logs channel.
    Ping { message: Option<String> },
    /// Truncate the listing history to its header row.
    ClearHistory,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobwatch_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = jobwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} known={} new={} messages={}",
                summary.run_id, summary.known_before, summary.new_listings, summary.messages_sent
            );
        }
        Commands::Parse { path, source } => {
            let adapter = adapter_for_source(&source)
                .with_context(|| format!("unknown source '{source}'"))?;
            let document = load_document(&path, &source)?;
            let records = adapter.parse_listing(&document)?;
            for record in &records {
                println!("{}\n", record.formatted());
            }
            tracing::info!(source = %source, listings = records.len(), "parsed {}", path.display());
        }
        Commands::Ping { message } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            let message = message.unwrap_or_else(|| health_message(&chrono::Local::now()));
            pipeline.ping(&message).await?;
        }
        Commands::ClearHistory => {
            let config = SyncConfig::from_env()?;
            let location = config.history_location();
            SyncPipeline::new(config)?.clear_history().await?;
            println!("cleared listing history at {location}");
        }
    }

    Ok(())
}
