use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tonic::transport::Server;

use stellar_fakeserver::config::FakeServerConfig;

#[derive(Parser)]
#[command(name = "stellar-fakeserver")]
#[command(about = "Fake scheduling and telemetry service for local runs", long_about = None)]
struct Args {
    /// Configuration file; defaults are used when it does not exist
    #[arg(short, long, default_value = "fakeserver.toml")]
    config: PathBuf,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = FakeServerConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let _logging_guard = stellar_common::logging::init_logging("logs", "stellar-fakeserver", &config.log_level)
        .context("Failed to initialize logging")?;

    let server_addr = config.server_address().parse()?;
    tracing::info!("Fake ground station service starting on {}", server_addr);
    tracing::info!(
        "Schedule: a {}s pass every {} minutes for satellite {}",
        config.schedule.pass_duration_secs,
        config.schedule.pass_every_minutes,
        config.schedule.satellite_id
    );

    Server::builder()
        .add_service(stellar_fakeserver::ground_station_service(Arc::new(config)))
        .serve_with_shutdown(server_addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown signal received.");
        })
        .await?;

    Ok(())
}
