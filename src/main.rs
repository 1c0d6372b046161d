//! compute-mux: a multiplexed control/compute server
//!
//! Clients hold a text control connection on a well-known port and ask it
//! for data channels:
//! - Stream (TCP) channels carrying length-framed compute requests
//! - Datagram (UDP) channels carrying single-packet compute requests
//!
//! Features:
//! - Fixed-capacity connection registry
//! - On-demand channel provisioning in configurable port ranges
//! - Bounds-checked indexed arithmetic over client-supplied arrays
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        bind_host = %config.bind_host,
        frame_timeout = ?config.frame_timeout,
        "Starting compute-mux server"
    );

    runtime::run(config)?;
    Ok(())
}
