//! # Beacon Server
//!
//! Realtime event streaming with presence and rate limiting.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single instance, in-process state)
//! beacon
//!
//! # Run with a config file
//! BEACON_CONFIG=/path/to/beacon.toml beacon
//!
//! # Run with environment overrides
//! BEACON_PORT=8080 BEACON_REDIS__URL=redis://127.0.0.1:6379 beacon
//! ```

mod auth;
mod config;
mod handlers;
mod identity;
mod limits;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,beacon_core=debug,beacon_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
