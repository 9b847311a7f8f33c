use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "patrolx-cli")]
#[command(about = "Ingest MVC incidents into the unified incidents table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed once and upsert every MVC incident (default)
    Sync,
    /// Create or update the unified_incidents schema
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if dotenv::dotenv().is_err() {
        info!(".env file not found, using process environment");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = patrolx_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} candidates={} saved={} skipped={} weather_missing={}",
                summary.run_id,
                summary.fetched,
                summary.candidates,
                summary.saved,
                summary.skipped,
                summary.weather_missing
            );
        }
        Commands::Migrate => {
            patrolx_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
