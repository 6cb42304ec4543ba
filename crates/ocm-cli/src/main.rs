use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ocm-cli")]
#[command(about = "Offering Catalogue Mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit.
    Sync,
    /// Run the sync daemon until the process is terminated.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Sync => {
            let summary = ocm_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} offerings={} customers_synced={} customers_failed={} resources_created={} resources_updated={} resources_retired={} offers_created={} offers_skipped={}",
                summary.run_id,
                summary.offerings_seen,
                summary.customers_synced,
                summary.customers_failed,
                summary.resources_created,
                summary.resources_updated,
                summary.resources_retired,
                summary.offers_created,
                summary.offers_skipped,
            );
        }
        Commands::Run => {
            if let Err(err) = ocm_sync::run_daemon_from_env().await {
                // Only startup failures reach here; cycle failures are
                // contained by the scheduler.
                error!(error = %format!("{err:#}"), "daemon failed to start");
                return Err(err);
            }
        }
    }

    Ok(())
}
