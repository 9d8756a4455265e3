use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use stellar_modem::api::{Credentials, GrpcConnector};
use stellar_modem::monitor::{run_monitor, MonitorOptions};

#[derive(Parser, Debug)]
#[command(name = "stellar-stream")]
#[command(about = "Open one API stream for a satellite and log what arrives", long_about = None)]
struct Args {
    /// API endpoint
    #[arg(long, env = "STELLARSTATION_API_URL", default_value = "https://api.stellarstation.com")]
    url: String,

    /// Path to the API key file
    #[arg(long, env = "STELLARSTATION_API_KEY", value_name = "FILE")]
    key: String,

    /// Satellite to open the stream for
    #[arg(short, long)]
    satellite_id: String,

    /// Only log telemetry and commands for this plan
    #[arg(short, long)]
    plan_id: Option<String>,

    /// Keep reconnecting if the stream drops
    #[arg(short, long)]
    reconnect: bool,

    /// Resume an earlier stream on the first connect
    #[arg(long, value_name = "STREAM_ID")]
    reconnect_stream_id: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _logging_guard = stellar_common::logging::init_logging("logs", "stellar-stream", &args.log_level)
        .context("Failed to initialize logging")?;
    tracing::info!("Streaming satellite {} from {}", args.satellite_id, args.url);

    let credentials = Credentials::from_key_file(&args.key)?;
    let connector = GrpcConnector::new(args.url, credentials);

    let mut options = MonitorOptions::new(args.satellite_id);
    options.plan_id = args.plan_id;
    options.reconnect = args.reconnect;
    options.resume_stream_id = args.reconnect_stream_id;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
        tracing::info!("Shutdown signal received.");
        on_signal.cancel();
    });

    let logged = run_monitor(Arc::new(connector), options, cancel).await?;
    tracing::info!("Stream closed after {} units", logged);

    Ok(())
}
