//! `PeerLink` signaling relay.
//!
//! An axum WebSocket server that tracks which peers are online and routes
//! offers, answers and ICE candidates between them. Chat traffic never
//! passes through it. Ctrl-C sends every connected peer a close frame
//! before exiting.
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin peerlink-relay
//!
//! # Run on custom address
//! cargo run --bin peerlink-relay -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use peerlink_relay::config::{RelayCliArgs, RelayConfig};
use peerlink_relay::relay::{self, RelayState};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting peerlink relay");

    let state = Arc::new(RelayState::with_max_message_size(config.max_message_size));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down, closing peer sockets");
                    state.close_all_connections().await;
                    // Let the writer tasks flush their close frames.
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    }
}
