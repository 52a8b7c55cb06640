use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trailsync_storage::{PgTrailerStatusStore, SchemaStatus};
use trailsync_sync::config::telegram_from_env;
use trailsync_sync::{
    build_scheduler, http_config, FeedSource, LastRunRecorder, RunGuard, SyncConfig, SyncPipeline,
    TelegramAlerter,
};
use trailsync_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "trailsync")]
#[command(about = "Trailer location sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print its summary.
    Sync {
        /// Read feed payloads from `<dir>/<feed>/sample.*` instead of the live feeds.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the trailer_status table when it is missing.
    Migrate,
    /// Start the scheduler and the health server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trailsync=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            let (pipeline, alerter) = match sync_pipeline(fixtures).await {
                Ok(built) => built,
                Err(err) => {
                    error!(error = %err, "start-up failed");
                    alert_startup_failure(&format!("Start-up failed: {err:#}")).await;
                    return Err(err);
                }
            };
            let result = pipeline.run_once().await;
            // The failure alert is spawned by the observer; let it land before the runtime stops.
            if let Some(alerter) = &alerter {
                alerter.flush().await;
            }
            let summary = result?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
            let store = PgTrailerStatusStore::connect(&database_url).await?;
            match store.ensure_schema(false).await? {
                SchemaStatus::Present => println!("trailer_status already present"),
                SchemaStatus::Created => println!("trailer_status created"),
            }
        }
        Commands::Serve => {
            if let Err(err) = serve().await {
                error!(error = %err, "start-up failed");
                alert_startup_failure(&format!("Start-up failed: {err:#}")).await;
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn sync_pipeline(fixtures: Option<PathBuf>) -> Result<(SyncPipeline, Option<TelegramAlerter>)> {
    let config = SyncConfig::from_env()?;
    let store = connect_checked(&config.database_url).await?;
    let source = fixtures.map(FeedSource::Fixtures).unwrap_or(FeedSource::Live);
    let mut pipeline = SyncPipeline::from_config(&config, Arc::new(store), source)?;
    let alerter = alerter(&config)?;
    if let Some(alerter) = &alerter {
        pipeline = pipeline.with_observer(Arc::new(alerter.clone()));
    }
    Ok((pipeline, alerter))
}

async fn serve() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = connect_checked(&config.database_url).await?;
    let pool = store.pool().clone();

    let recorder = LastRunRecorder::new();
    let guard = RunGuard::new();
    let mut pipeline = SyncPipeline::from_config(&config, Arc::new(store), FeedSource::Live)?
        .with_observer(Arc::new(recorder.clone()));
    if let Some(alerter) = alerter(&config)? {
        pipeline = pipeline.with_observer(Arc::new(alerter));
    }

    let cron = config.settings.schedule_cron.clone();
    let sched = build_scheduler(Arc::new(pipeline), guard.clone(), &cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    trailsync_web::serve(AppState::new(Some(pool), recorder, guard), trailsync_web::port_from_env()).await
}

/// Connects and requires the table to exist already.
async fn connect_checked(database_url: &str) -> Result<PgTrailerStatusStore> {
    let store = PgTrailerStatusStore::connect(database_url)
        .await
        .context("connecting to database")?;
    store
        .ensure_schema(true)
        .await
        .context("trailer_status check failed; run `trailsync migrate`")?;
    Ok(store)
}

fn alerter(config: &SyncConfig) -> Result<Option<TelegramAlerter>> {
    config
        .telegram
        .clone()
        .map(|credentials| TelegramAlerter::new(credentials, http_config(config)))
        .transpose()
}

async fn alert_startup_failure(message: &str) {
    let Some(credentials) = telegram_from_env() else {
        return;
    };
    match TelegramAlerter::new(credentials, Default::default()) {
        Ok(alerter) => {
            if let Err(err) = alerter.notify(message).await {
                error!(error = %err, "start-up alert not delivered");
            }
        }
        Err(err) => error!(error = %err, "could not build alert client"),
    }
}
