mod session;

use anyhow::{anyhow, Result};
use bench_shared::resource::DEFAULT_SCPI_PORT;
use bench_shared::sim::VirtualInstrument;
use clap::Parser;
use session::{InstrumentSession, SharedInstrument};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// SCPI instrument simulator served over raw TCP sockets
#[derive(Parser, Debug)]
#[command(name = "sim-instrument", version)]
struct Args {
    /// Listen address
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_SCPI_PORT}"))]
    bind: String,

    /// Answer to `*IDN?`
    #[arg(long, default_value = "Bench Console,Virtual Instrument,SIM-0001,1.0")]
    identity: String,

    /// Power-on setting kept across `*RST`, as HEADER=VALUE (repeatable)
    #[arg(long = "preset", value_parser = parse_preset)]
    presets: Vec<(String, String)>,
}

fn parse_preset(raw: &str) -> Result<(String, String)> {
    let (header, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected HEADER=VALUE, got '{raw}'"))?;
    Ok((header.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let instrument = args
        .presets
        .iter()
        .fold(VirtualInstrument::new(&args.identity), |sim, (header, value)| {
            sim.with_preset(header, value)
        });
    let instrument: SharedInstrument = Arc::new(Mutex::new(instrument));

    let listener = TcpListener::bind(&args.bind).await?;
    info!("[SIM] '{}' listening on {}", args.identity, args.bind);

    loop {
        let (stream, addr) = listener.accept().await?;
        let session = InstrumentSession::new(stream, addr, Arc::clone(&instrument));
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                error!("[SIM] Session {} ended: {:#}", addr, e);
            }
        });
    }
}
