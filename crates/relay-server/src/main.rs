//! # Relay Server
//!
//! Real-time WebSocket gateway for the chat backend.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (a JWT secret is still required)
//! RELAY_AUTH__JWT_SECRET=... relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Override individual settings
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 RELAY_LIMITS__OUTBOUND_QUEUE=512 relay
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time WebSocket gateway for the chat backend
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;
    config.validate()?;

    tracing::info!("Starting relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
