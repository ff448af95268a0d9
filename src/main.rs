mod command;
mod config;
mod events;
mod fleet;
mod instrument;
mod inventory;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use command::{CommandRepository, Router};
use config::ConsoleConfig;
use events::{inventory_event, InboundEvent, OutboundEvent};
use fleet::FleetSupervisor;
use instrument::DriverFactory;
use inventory::InventoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bench console: translates bus events into SCPI traffic for a fleet of instruments
///
/// Inbound events are read from stdin and outbound events written to stdout,
/// one JSON object `{"topic": ..., "payload": ...}` per line.
#[derive(Parser, Debug)]
#[command(name = "bench-console", version)]
struct Args {
    /// Directory holding the repository, inventory and response journal
    #[arg(long, default_value = "DATA")]
    data_dir: PathBuf,

    /// Instrument address to probe on every scan (repeatable)
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// Rescan period in seconds; 0 scans only on request
    #[arg(long, default_value_t = bench_shared::timing::SCAN_INTERVAL_SECS)]
    scan_interval_secs: u64,

    /// Bounded wait for a query response
    #[arg(long, default_value_t = bench_shared::timing::QUERY_TIMEOUT_MS)]
    query_timeout_ms: u64,

    /// Prefix of the topics decoded outputs are published on
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Device key or address used when no device matches a trigger's model
    #[arg(long)]
    default_target: Option<String>,

    /// Do not journal answered queries
    #[arg(long)]
    no_journal: bool,
}

impl Args {
    fn into_config(self) -> ConsoleConfig {
        let mut config = ConsoleConfig::default().with_data_dir(self.data_dir);
        config.candidates = self.addresses;
        config.scan_interval =
            (self.scan_interval_secs > 0).then(|| Duration::from_secs(self.scan_interval_secs));
        config.fleet.dispatch.query_timeout = Duration::from_millis(self.query_timeout_ms);
        if let Some(prefix) = self.topic_prefix {
            config.pipeline.output_prefix = prefix;
        }
        config.pipeline.default_target = self.default_target;
        if self.no_journal {
            config.fleet.journal_dir = None;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create data directory {}", config.data_dir.display()))?;

    info!("Bench console starting");
    info!("  Data directory: {}", config.data_dir.display());
    info!("  Candidates: {}", config.candidates.len());
    match config.scan_interval {
        Some(period) => info!("  Scan interval: {:?}", period),
        None => info!("  Scan interval: on request"),
    }

    let repository = Arc::new(CommandRepository::load(config.repository_path()));
    let inventory = InventoryStore::new(config.inventory_path());
    let (fleet, fleet_events) = FleetSupervisor::new(
        Arc::new(transport::ResourceConnector::new()),
        DriverFactory::default(),
        config.fleet.clone(),
    );

    let (router, mut outbound) = Router::new(
        repository,
        Arc::new(fleet),
        inventory.clone(),
        config.pipeline.clone(),
        config.candidates.clone(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(256);
    let stdout_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        // Last known inventory goes out before anything else
        let previous = inventory.load();
        if !previous.is_empty() {
            write_event(&mut stdout, &inventory_event(&previous)).await;
        }
        while let Some(event) = outbound.recv().await {
            write_event(&mut stdout, &event).await;
        }
    });
    let router_task = tokio::spawn(router.run(inbound_rx, fleet_events, config.scan_interval));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<InboundEvent>(&line) {
                    Ok(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed event: {}", e),
                },
                None => {
                    info!("stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(inbound_tx);
    router_task.await.context("router task")?;
    stdout_task.await.context("output task")?;
    info!("Bench console stopped");
    Ok(())
}

async fn write_event(stdout: &mut tokio::io::Stdout, event: &OutboundEvent) {
    let mut line = match serde_json::to_vec(event) {
        Ok(line) => line,
        Err(e) => {
            warn!("Cannot encode event for '{}': {}", event.topic, e);
            return;
        }
    };
    line.push(b'\n');
    if let Err(e) = stdout.write_all(&line).await {
        warn!("stdout write failed: {}", e);
        return;
    }
    if let Err(e) = stdout.flush().await {
        debug!("stdout flush failed: {}", e);
    }
}
