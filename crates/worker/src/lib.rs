pub mod bootstrap;
pub mod health;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod logging;
pub mod wiring;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use triage_core::config::{AppConfig, LoadOptions};
use triage_core::ingestion::{BatchHandler, InMemoryLogConsumer, LogConsumer};
use triage_core::ConsumerRunner;

use crate::bootstrap::{Application, BootstrapError};

#[derive(Debug, Parser)]
#[command(name = "triage-worker", about = "Moderation ingestion worker")]
pub struct Cli {
    /// Config file; defaults to `triage.toml` or `config/triage.toml` when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: WorkerCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum WorkerCommand {
    /// Consume item submissions and run routing and enforcement rules.
    IngestItems {
        /// Read messages from a JSON-lines file instead of the log.
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Consume warehouse records and batch them into compressed files.
    ColdStorage {
        #[arg(long)]
        replay: Option<PathBuf>,
    },
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IngestItems { .. } => "items",
            Self::ColdStorage { .. } => "cold-storage",
        }
    }

    fn replay(&self) -> Option<&Path> {
        match self {
            Self::IngestItems { replay } | Self::ColdStorage { replay } => replay.as_deref(),
        }
    }

    fn topic<'a>(&self, config: &'a AppConfig) -> &'a str {
        match self {
            Self::IngestItems { .. } => &config.ingestion.item_topic,
            Self::ColdStorage { .. } => &config.cold_storage.topic,
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(LoadOptions {
        config_path: cli.config.clone(),
        require_file: cli.config.is_some(),
        ..LoadOptions::default()
    })?;
    logging::init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
        cli.command.name(),
        shutdown_rx.clone(),
    )
    .await?;

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(
                event_name = "system.worker.stopping",
                correlation_id = "shutdown",
                "shutdown requested"
            );
            let _ = signal_tx.send(true);
        }
    });

    let outcome = run_consumer(&app, &cli.command, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, health).await.is_err() {
        warn!(
            event_name = "system.health.shutdown_timeout",
            correlation_id = "shutdown",
            "health endpoint did not stop within the grace period"
        );
    }
    app.db_pool.close().await;
    info!(event_name = "system.worker.stopped", correlation_id = "shutdown", "worker stopped");

    outcome
}

pub async fn run_consumer(
    app: &Application,
    command: &WorkerCommand,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let handler: Arc<dyn BatchHandler> = match command {
        WorkerCommand::IngestItems { .. } => {
            Arc::new(wiring::item_pipeline(&app.config, &app.db_pool)?)
        }
        WorkerCommand::ColdStorage { .. } => {
            Arc::new(wiring::cold_storage_batcher(&app.config, &app.db_pool))
        }
    };
    let settings = match command {
        WorkerCommand::IngestItems { .. } => app.config.ingestion.runner_settings(),
        WorkerCommand::ColdStorage { .. } => {
            app.config.cold_storage.runner_settings(&app.config.ingestion)
        }
    };
    let consumer = log_consumer(&app.config, command)?;

    info!(
        event_name = "system.worker.started",
        correlation_id = "bootstrap",
        consumer = command.name(),
        topic = %command.topic(&app.config),
        replay = command.replay().is_some(),
        "worker started"
    );
    ConsumerRunner::new(command.name(), consumer, handler, settings).run(shutdown).await?;
    Ok(())
}

fn log_consumer(
    config: &AppConfig,
    command: &WorkerCommand,
) -> Result<Arc<dyn LogConsumer>, BootstrapError> {
    let topic = command.topic(config);
    if let Some(path) = command.replay() {
        let file = File::open(path).map_err(|source| BootstrapError::ReplayFile {
            path: path.display().to_string(),
            source,
        })?;
        let consumer = InMemoryLogConsumer::from_jsonl(
            BufReader::new(file),
            topic,
            config.ingestion.max_batch_messages,
        )?;
        return Ok(Arc::new(consumer));
    }
    broker_consumer(config, command, topic)
}

#[cfg(feature = "kafka")]
fn broker_consumer(
    config: &AppConfig,
    command: &WorkerCommand,
    topic: &str,
) -> Result<Arc<dyn LogConsumer>, BootstrapError> {
    let group_id = match command {
        WorkerCommand::IngestItems { .. } => &config.ingestion.consumer_group,
        WorkerCommand::ColdStorage { .. } => &config.cold_storage.consumer_group,
    };
    let consumer =
        kafka::KafkaLogConsumer::new(&config.kafka, group_id, topic, config.ingestion.max_batch_messages)
            .map_err(|error| BootstrapError::Consumer(error.to_string()))?;
    Ok(Arc::new(consumer))
}

#[cfg(not(feature = "kafka"))]
fn broker_consumer(
    _config: &AppConfig,
    _command: &WorkerCommand,
    topic: &str,
) -> Result<Arc<dyn LogConsumer>, BootstrapError> {
    Err(BootstrapError::Consumer(format!(
        "no log transport for `{topic}`; rebuild with the `kafka` feature or pass --replay <file>"
    )))
}
