use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use q2e_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "q2e")]
#[command(about = "Sync Quartzy inventory to eLabFTW")]
struct Cli {
    /// Enable verbose output for debugging
    #[arg(long, global = true)]
    verbose: bool,
    /// Disable TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import allowed Quartzy categories into eLabFTW (default)
    Sync,
    /// Write the complete raw Quartzy inventory to a JSON file
    Inventory {
        #[arg(long, default_value = "inventory.json")]
        output: PathBuf,
    },
    /// Print the eLabFTW version
    Info,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "q2e_sync=debug,q2e_adapters=debug,q2e_http=debug"
    } else {
        "error"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = SyncConfig::from_env()?;
    config.insecure = cli.insecure;
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} fetched={} filtered={} created={} updated={} unchanged={} skipped={} failed={}",
                summary.run_id,
                summary.fetched_items,
                summary.filtered_items,
                summary.stats.created,
                summary.stats.updated,
                summary.stats.unchanged,
                summary.stats.skipped,
                summary.stats.failed,
            );
        }
        Commands::Inventory { output } => {
            let items = pipeline.dump_inventory().await;
            let bytes = serde_json::to_vec_pretty(&items).context("serializing inventory")?;
            tokio::fs::write(&output, bytes)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("fetched {} items into {}", items.len(), output.display());
        }
        Commands::Info => {
            let info = pipeline.check_version().await?;
            println!(
                "eLabFTW {} ({})",
                info.elabftw_version.as_deref().unwrap_or("unknown"),
                info.elabftw_version_int.unwrap_or(0)
            );
        }
    }

    Ok(())
}
