//! `courtside-presence` -- authoritative presence server.
//!
//! An axum WebSocket server that tracks which Courtside users are online
//! from their heartbeats and pushes online/offline transitions to
//! subscribed connections.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin courtside-presence
//!
//! # Shorter TTL for local testing
//! cargo run --bin courtside-presence -- --bind 127.0.0.1:9100 --ttl-secs 20
//!
//! # Or via environment variable
//! PRESENCE_ADDR=127.0.0.1:9100 cargo run --bin courtside-presence
//! ```

use std::sync::Arc;

use clap::Parser;
use courtside_presence::config::{PresenceCliArgs, PresenceConfig};
use courtside_presence::server::{self, PresenceState};

#[tokio::main]
async fn main() {
    let cli = PresenceCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match PresenceConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting courtside presence server");

    let state = Arc::new(PresenceState::with_config(
        config.tracker,
        config.max_subscription,
    ));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "presence server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "presence server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start presence server");
            std::process::exit(1);
        }
    }
}
