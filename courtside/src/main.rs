//! `courtside`: presence watcher for the Courtside chat client.
//!
//! Connects to a `courtside-presence` server as a user, keeps that user
//! online with heartbeats, subscribes to a list of ids through the
//! interest registry and prints every online/offline change.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/courtside/config.toml`).
//!
//! ```bash
//! cargo run --bin courtside -- --server-url ws://127.0.0.1:9100/presence \
//!     --user-id alice --watch bob,carol
//!
//! # Or via environment variables
//! COURTSIDE_SERVER_URL=ws://127.0.0.1:9100/presence COURTSIDE_USER_ID=alice \
//!     cargo run --bin courtside -- --watch bob
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use courtside::config::{CliArgs, ClientConfig};
use courtside::presence::connection::{ConnectionConfig, PresenceConnection};
use courtside::presence::interest::{InterestRegistry, Priority};
use courtside::presence::{ConnectionEvent, PresenceBoard};
use courtside_proto::message::UserId;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let (Some(server_url), Some(user_id)) = (config.server_url.clone(), config.user_id.clone())
    else {
        eprintln!("Both --server-url and --user-id are required");
        std::process::exit(2);
    };

    tracing::info!(user_id = %user_id, url = %server_url, "courtside starting");

    let connection_config = ConnectionConfig {
        heartbeat: config.heartbeat,
        reconnect: config.reconnect.clone(),
        ..ConnectionConfig::default()
    };
    let (connection, mut events) =
        match PresenceConnection::start(&server_url, user_id, connection_config) {
            Ok(started) => started,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        };

    let registry = Arc::new(InterestRegistry::new(
        Arc::new(connection),
        Arc::new(PresenceBoard::new()),
        config.interest.clone(),
    ));
    let watched: Vec<UserId> = cli.watch.iter().map(UserId::new).collect();
    registry.want("cli-watch", Priority::High, watched);

    while let Some(event) = events.recv().await {
        match &event {
            ConnectionEvent::Connected { reconnect } => {
                println!("connected{}", if *reconnect { " (reconnect)" } else { "" });
            }
            ConnectionEvent::Disconnected => println!("disconnected, retrying"),
            ConnectionEvent::Presence(_) => {}
        }
        for (id, online) in registry.handle_event(&event).await {
            println!("{id} is {}", if online { "online" } else { "offline" });
        }
    }

    tracing::info!("courtside exiting");
}

/// Initialize file-based logging.
///
/// Logs are written to a file so they do not interleave with the presence
/// output on stdout. Returns a [`WorkerGuard`] that must be held until
/// shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courtside.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
