//! linkwatch - network reachability and latency monitor.
//!
//! Pings a target and times HTTP requests to it on independent timers,
//! tagging every result with the monitor's public IP.

mod address;
mod config;
mod logging;
mod probe;
mod scheduler;

use address::HttpAddressLookup;
use clap::Parser;
use config::{Cli, ScheduleConfig};
use scheduler::{bootstrap, NetworkProbes, StartupError};

use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let log_file = Arc::new(logging::open_log(&cli.log).map_err(StartupError::LogDestination)?);
    logging::init(log_file.clone(), cli.verbose);

    let result = run(cli).await;
    if let Err(e) = &result {
        tracing::error!("{}", e);
    }
    logging::flush(&log_file);

    result.map_err(Into::into)
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = ScheduleConfig::from_cli(&cli)?;
    tracing::debug!(
        "Arguments: {}",
        serde_json::to_string(&config).unwrap_or_default()
    );

    let lookup = HttpAddressLookup::new(config.ip_lookup_url.clone(), config.http_timeout)?;
    let scheduler = Arc::new(bootstrap(config, Box::new(lookup), Arc::new(NetworkProbes)).await?);

    let signal_scheduler = scheduler.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                signal_scheduler.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for interrupt: {}", e),
        }
    });

    scheduler.run().await;
    tracing::info!(
        public_ip = %scheduler.public_address().current(),
        "linkwatch exiting"
    );
    Ok(())
}
