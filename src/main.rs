//! Chat Relay Server - Entry Point
//!
//! Starts the ChatServer engine and runs until Ctrl-C.
//!
//! Usage: `line_relay [host] [port]`; `LINE_RELAY_HOST` / `LINE_RELAY_PORT`
//! are read first and command line arguments override them.

use std::env;

use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use line_relay::{ChatServer, ServerConfig, ServerEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=line_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("line_relay=info")),
        )
        .init();

    // Bind address: environment first, then positional arguments
    let mut config = ServerConfig::from_env();
    let mut args = env::args().skip(1);
    if let Some(host) = args.next() {
        config.host = host;
    }
    if let Some(port) = args.next() {
        config.port = port.parse()?;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let server = ChatServer::new(config, event_tx);
    server.start().await?;

    // Log lines are already mirrored to tracing by the engine
    let watcher = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let ServerEvent::Roster(roster) = event {
                let names: Vec<&str> = roster.iter().map(|e| e.username.as_str()).collect();
                debug!("Roster ({}): {:?}", names.len(), names);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.stop().await;
    watcher.abort();

    Ok(())
}
