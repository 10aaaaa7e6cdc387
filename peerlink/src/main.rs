//! `PeerLink` — headless peer-to-peer chat client.
//!
//! Connects to a signaling relay, negotiates a WebRTC data channel with the
//! remote peer and exchanges encrypted chat lines over stdin/stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/peerlink/config.toml`).
//!
//! ```bash
//! cargo run --features webrtc --bin peerlink -- \
//!     --signaling-url ws://127.0.0.1:9000/ws --peer-id alice --remote-peer bob
//! ```
//!
//! Both sides need the same session key; without a shared key store the
//! demo derives it from `PEERLINK_SHARED_KEY` (64 hex characters) or
//! generates one and prints it.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use peerlink::config::{CliArgs, ClientConfig};
use peerlink::crypto::keys::{SessionKey, SharedKeyProvider};
use peerlink::rtc::webrtc::WebRtcBackend;
use peerlink::service::PeerService;
use peerlink::signal::client::SignalingClient;
use peerlink::store::memory::InMemoryStore;
use peerlink_proto::message::{Message, MessageBody, PeerId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let local_id = config.peer_id.clone().unwrap_or_else(PeerId::generate);
    tracing::info!(peer = %local_id, "peerlink starting");

    let keys = match shared_key() {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("Invalid PEERLINK_SHARED_KEY: {e}");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
        }
    };

    let (signaling, signal_events) = SignalingClient::spawn(
        config.signaling.clone(),
        local_id.clone(),
        config.channel_capacity,
    )
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let signaling = Arc::new(signaling);

    let (service, mut notices) = PeerService::new(
        WebRtcBackend::new(config.peer.ice_servers.clone()),
        Arc::clone(&signaling),
        signal_events,
        InMemoryStore::new(),
        Arc::new(keys),
        &config,
    );
    let mut inbound = service.subscribe();
    service.start();

    println!("You are {local_id}.");
    match &config.remote_peer {
        Some(remote) => println!("Chatting with {remote}. Type a line and press enter."),
        None => println!("No --remote-peer given; listening only."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let Some(remote) = config.remote_peer.clone() else {
                    println!("(no remote peer)");
                    continue;
                };
                let outcome = service
                    .send_message(Message::chat(local_id.clone(), remote, text))
                    .await;
                println!("[{outcome}]");
            }
            batch = inbound.recv() => {
                let Some(batch) = batch else {
                    break;
                };
                for message in batch {
                    print_message(&message);
                }
            }
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    break;
                };
                tracing::debug!(?notice, "notice");
            }
        }
    }

    service.stop().await;
    signaling.shutdown();
    tracing::info!("peerlink exiting");
    Ok(())
}

fn print_message(message: &Message) {
    match &message.body {
        MessageBody::Chat { text } => println!("<{}> {text}", message.sender_id),
        MessageBody::DeliveryReceipt { message_id } => {
            tracing::debug!(message_id = %message_id, "delivered");
        }
        MessageBody::PeerConnected { peer_id } => println!("* {peer_id} is online"),
        MessageBody::PeerDisconnected { peer_id } => println!("* {peer_id} went offline"),
        MessageBody::GroupCreated { name, .. } => println!("* added to group {name}"),
        other => tracing::debug!(kind = %other.kind(), "ignoring message"),
    }
}

/// Session key shared with the remote peer.
fn shared_key() -> Result<SharedKeyProvider, String> {
    let Ok(hex) = std::env::var("PEERLINK_SHARED_KEY") else {
        let keys = SharedKeyProvider::generate();
        println!("Generated session key {}", keys.key().to_hex());
        return Ok(keys);
    };
    let key = SessionKey::from_hex(hex.trim()).map_err(|e| e.to_string())?;
    Ok(SharedKeyProvider::new(key))
}

/// Initialize file-based logging.
///
/// Logs are written to a file so they never interleave with the chat on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("peerlink.log");
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
