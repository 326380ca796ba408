mod config;
mod dispatch;
mod poller;
mod processor;
mod scheduler;
mod source;
mod store;
mod update;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatch::{LogHandler, Router};
use crate::poller::Poller;
use crate::processor::Processor;
use crate::scheduler::tasks::maintenance_jobs;
use crate::scheduler::Scheduler;
use crate::source::TelegramSource;
use crate::store::{QueueRecord, QueueStore};

/// Abandoned records shown by `relaybot status`
const STATUS_ABANDONED_LIMIT: usize = 20;

#[derive(Debug, PartialEq)]
enum Command {
    Run(PathBuf),
    Status(PathBuf),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Command {
    let default_path = || PathBuf::from("config.toml");
    match args.next() {
        Some(arg) if arg == "status" => {
            Command::Status(args.next().map(PathBuf::from).unwrap_or_else(default_path))
        }
        Some(arg) => Command::Run(PathBuf::from(arg)),
        None => Command::Run(default_path()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match parse_args(std::env::args().skip(1)) {
        Command::Run(path) => run(&path).await,
        Command::Status(path) => status(&path).await,
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    info!("Loading configuration from: {}", config_path.display());
    Config::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    info!("Configuration loaded successfully");
    info!("  API: {}", config.telegram.api_url);
    info!(
        "  Poll wait: {}s (client timeout {:?}), limit {}",
        config.polling.fetch_timeout_secs,
        config.polling.request_timeout(),
        config.polling.fetch_limit
    );
    info!("  Retry budget: {}", config.processing.retry_budget);
    info!("  Database: {}", config.store.database_path.display());

    let store = QueueStore::open(&config.store.database_path)?;
    info!("Queue state: {}", store.stats().await?);

    let shutdown = CancellationToken::new();

    let source = Arc::new(TelegramSource::new(
        &config.telegram,
        Duration::from_secs(config.polling.request_grace_secs),
    ));
    let poller = Poller::new(source, store.clone(), config.poller(), shutdown.clone());

    let dispatcher = Arc::new(Router::new(LogHandler));
    let processor = Processor::new(
        store.clone(),
        dispatcher,
        config.processor(),
        shutdown.clone(),
    );

    let scheduler = Scheduler::start(maintenance_jobs(&store, &config)).await?;

    let poller_task = tokio::spawn(poller.run());
    let processor_task = tokio::spawn(processor.run());

    info!("Relay is running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    shutdown.cancel();

    let (poller_result, processor_result) = tokio::join!(poller_task, processor_task);
    if let Err(e) = poller_result {
        error!("Poller task ended abnormally: {}", e);
    }
    if let Err(e) = processor_result {
        error!("Processor task ended abnormally: {}", e);
    }

    scheduler.shutdown().await?;
    info!("Stopped with queue state: {}", store.stats().await?);
    Ok(())
}

async fn status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let store = QueueStore::open(&config.store.database_path)?;

    println!("{}", store.stats().await?);
    let abandoned = store.list_abandoned(STATUS_ABANDONED_LIMIT).await?;
    if !abandoned.is_empty() {
        println!("\nRecently abandoned:");
        for record in &abandoned {
            println!("  {}", format_abandoned(record));
        }
    }
    Ok(())
}

fn format_abandoned(record: &QueueRecord) -> String {
    let when = record
        .abandoned_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let last = record
        .last_failure()
        .map(|f| f.reason.as_str())
        .unwrap_or("no failure recorded");
    format!(
        "#{} update {} ({}) queued {} abandoned {} after {} attempt(s): {}",
        record.id,
        record.update.update_id,
        record.update.kind,
        record.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
        when,
        record.failure_count,
        last
    )
}
