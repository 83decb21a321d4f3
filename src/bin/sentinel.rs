//! CLI entrypoint: `alert-sentinel run` starts the full listener/dispatcher
//! pipeline against the configured transport; `alert-sentinel ingest <file>`
//! deserializes and handles a single payload file once, for replay/testing.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use alert_sentinel::config::Config;
use alert_sentinel::db::Databases;
use alert_sentinel::handler;
use alert_sentinel::skymap::HttpSkymapFetcher;

#[derive(Parser, Debug)]
#[command(name = "alert-sentinel")]
#[command(about = "Transient alert ingestion and tiling sentinel")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the sentinel against the configured listener mode.
    Run,
    /// Deserialize and handle a single payload file once (replay/testing).
    Ingest {
        /// Path to a raw VOEvent XML, VOEvent-JSON or Kafka JSON payload.
        file: String,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = CliArgs::parse();
    let config = Config::load().context("failed to load configuration")?;

    match args.command {
        Command::Run => run(config).await,
        Command::Ingest { file } => ingest(config, &file).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!(mode = ?config.listener_mode, "starting alert-sentinel");

    let dbs = Databases::in_memory();
    let running = Arc::new(AtomicBool::new(true));

    let shutdown_running = running.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C, shutting down");
        shutdown_running.store(false, std::sync::atomic::Ordering::Relaxed);
    });

    alert_sentinel::sentinel::run(config, dbs, running).await;
    info!("alert-sentinel shutdown complete");
    Ok(())
}

async fn ingest(config: Config, path: &str) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read payload file {path}"))?;
    let payload = alert_sentinel::notice::deserialize(&bytes).context("failed to deserialize payload")?;
    let notice = alert_sentinel::notice::classify(payload, &config.local_ivo, chrono::Utc::now());

    let dbs = Databases::in_memory();
    let fetcher = HttpSkymapFetcher::default();
    let outcome = handler::handle_notice(&dbs, &fetcher, &config, &notice, chrono::Utc::now())
        .await
        .context("failed to handle ingested notice")?;

    info!(
        event = %outcome.event_name,
        strategy = %outcome.strategy_key,
        survey = ?outcome.survey_name,
        targets_created = outcome.targets_created,
        targets_tombstoned = outcome.targets_tombstoned,
        "ingest complete"
    );
    Ok(())
}
