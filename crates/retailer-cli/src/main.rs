use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use retailer_storage::DestinationDb;
use retailer_sync::{
    destination_url, maybe_build_scheduler, run_sync_once_from_env, SyncConfig, SyncOptions,
    DESTINATION_DATABASE_URL, SCHEDULER_ENABLED,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "retailer-sync")]
#[command(about = "Sync retailer master data from the source database into retailer_master")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and exit (default).
    Sync {
        /// Apply every upsert, then roll back instead of committing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a sync on every RETAILER_SYNC_CRON tick until Ctrl-C.
    Schedule,
    /// Print the retailer_master row for one retailer as JSON.
    Lookup { retailer_id: String },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            // run_sync_once_from_env logs its own failures.
            return match run_sync_once_from_env(SyncOptions { dry_run }).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            };
        }
        Commands::Schedule => schedule().await,
        Commands::Lookup { retailer_id } => lookup(&retailer_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn schedule() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let Some(mut sched) = maybe_build_scheduler(config, SyncOptions::default()).await? else {
        bail!("scheduler is disabled; set {SCHEDULER_ENABLED}=1 to enable it");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn lookup(retailer_id: &str) -> Result<()> {
    let url = destination_url(&|key: &str| std::env::var(key).ok())
        .with_context(|| format!("{DESTINATION_DATABASE_URL} is not set"))?;
    let mut db = DestinationDb::connect(&url).await?;
    let row = db.fetch_retailer(retailer_id).await;
    db.close().await?;

    match row? {
        Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
        None => bail!("retailer {retailer_id} not found in retailer_master"),
    }
    Ok(())
}
