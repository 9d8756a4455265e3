use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use stellar_modem::config::ModemConfig;
use stellar_modem::Modem;

#[derive(Parser)]
#[command(name = "stellar-modem")]
#[command(about = "Relay telemetry between a ground station and the scheduling service during passes", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Ground station name (blank for the configured default)
    #[arg(short, long, default_value = "")]
    ground_station: String,
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ModemConfig::from_file(&args.config)?;

    let _logging_guard = stellar_common::logging::init_logging("logs", "stellar-modem", &config.log_level)
        .context("Failed to initialize logging")?;

    tracing::info!("Stellar modem starting with {}", args.config.display());

    let modem = Modem::from_config(&config, Some(args.ground_station.as_str()))?;
    modem.start().await;

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received.");

    modem.stop();
    modem.wait().await;

    Ok(())
}
