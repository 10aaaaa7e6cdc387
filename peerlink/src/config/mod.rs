//! Configuration for the `PeerLink` client core.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/peerlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use peerlink_proto::message::{PeerId, UserId};

use crate::signal::backoff::ReconnectPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    signaling: SignalingFileConfig,
    peer: PeerFileConfig,
    delivery: DeliveryFileConfig,
    presence: PresenceFileConfig,
}

/// `[signaling]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SignalingFileConfig {
    url: Option<String>,
    peer_id: Option<String>,
    user_id: Option<String>,
    remote_peer: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_max_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    event_buffer: Option<usize>,
}

/// `[peer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerFileConfig {
    channel_label: Option<String>,
    ice_servers: Option<Vec<String>>,
    recreate_delay_ms: Option<u64>,
    negotiation_timeout_secs: Option<u64>,
    connection_check_secs: Option<u64>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    batch_size: Option<usize>,
    batch_interval_ms: Option<u64>,
    max_payload_size: Option<usize>,
    max_duplicate_tracking: Option<usize>,
    notice_buffer: Option<usize>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    heartbeat_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Signaling relay connection settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay WebSocket URL.
    pub url: String,
    /// Authenticated user announced in `user_connected`, if any.
    pub user_id: Option<UserId>,
    /// Timeout for one connect attempt.
    pub connect_timeout: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/ws".to_string(),
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Peer connection settings (used by `PeerConnectionManager`).
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Label of the outbound data channel.
    pub channel_label: String,
    /// STUN/TURN server URLs handed to the ICE agent.
    pub ice_servers: Vec<String>,
    /// Pause between closing a failed connection and recreating it.
    pub recreate_delay: Duration,
    /// How long a connection may sit in `new`/`connecting` before it is
    /// treated as failed.
    pub negotiation_timeout: Duration,
    /// How often stalled negotiations are looked for.
    pub connection_check_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            channel_label: "chat".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            recreate_delay: Duration::from_secs(1),
            negotiation_timeout: Duration::from_secs(15),
            connection_check_interval: Duration::from_secs(5),
        }
    }
}

/// Delivery pipeline settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Inbound messages per dispatched batch.
    pub batch_size: usize,
    /// Longest wait between the first buffered message and its dispatch.
    pub batch_interval: Duration,
    /// Maximum inbound frame size before decryption (bytes).
    pub max_payload_size: usize,
    /// Maximum number of message IDs tracked for duplicate detection.
    pub max_duplicate_tracking: usize,
    /// Capacity of the notice stream.
    pub notice_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval: Duration::from_millis(100),
            max_payload_size: 256 * 1024,
            max_duplicate_tracking: 10_000,
            notice_buffer: 256,
        }
    }
}

/// Presence settings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the local user is recorded as online.
    pub heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local peer identity; generated at startup when absent.
    pub peer_id: Option<PeerId>,
    /// Peer the headless client talks to.
    pub remote_peer: Option<PeerId>,
    /// Capacity of the signaling event channel.
    pub channel_capacity: usize,
    /// Relay settings.
    pub signaling: SignalingConfig,
    /// Connection settings.
    pub peer: PeerConfig,
    /// Delivery settings.
    pub delivery: DeliveryConfig,
    /// Presence settings.
    pub presence: PresenceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            remote_peer: None,
            channel_capacity: 256,
            signaling: SignalingConfig::default(),
            peer: PeerConfig::default(),
            delivery: DeliveryConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/peerlink/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sig = &file.signaling;
        let reconnect_defaults = defaults.signaling.reconnect;

        Self {
            peer_id: cli
                .peer_id
                .clone()
                .or_else(|| sig.peer_id.clone())
                .map(PeerId::new),
            remote_peer: cli
                .remote_peer
                .clone()
                .or_else(|| sig.remote_peer.clone())
                .filter(|p| !p.is_empty())
                .map(PeerId::new),
            channel_capacity: sig.event_buffer.unwrap_or(defaults.channel_capacity),
            signaling: SignalingConfig {
                url: cli
                    .signaling_url
                    .clone()
                    .or_else(|| sig.url.clone())
                    .unwrap_or(defaults.signaling.url),
                user_id: cli
                    .user_id
                    .clone()
                    .or_else(|| sig.user_id.clone())
                    .map(UserId::new),
                connect_timeout: sig
                    .connect_timeout_secs
                    .map_or(defaults.signaling.connect_timeout, Duration::from_secs),
                reconnect: ReconnectPolicy {
                    initial: sig
                        .reconnect_initial_ms
                        .map_or(reconnect_defaults.initial, Duration::from_millis),
                    multiplier: sig
                        .reconnect_multiplier
                        .unwrap_or(reconnect_defaults.multiplier),
                    max_delay: sig
                        .reconnect_max_secs
                        .map_or(reconnect_defaults.max_delay, Duration::from_secs),
                    max_attempts: sig
                        .reconnect_max_attempts
                        .unwrap_or(reconnect_defaults.max_attempts),
                },
            },
            peer: PeerConfig {
                channel_label: file
                    .peer
                    .channel_label
                    .clone()
                    .unwrap_or(defaults.peer.channel_label),
                ice_servers: file
                    .peer
                    .ice_servers
                    .clone()
                    .unwrap_or(defaults.peer.ice_servers),
                recreate_delay: file
                    .peer
                    .recreate_delay_ms
                    .map_or(defaults.peer.recreate_delay, Duration::from_millis),
                negotiation_timeout: file
                    .peer
                    .negotiation_timeout_secs
                    .map_or(defaults.peer.negotiation_timeout, Duration::from_secs),
                connection_check_interval: file
                    .peer
                    .connection_check_secs
                    .map_or(defaults.peer.connection_check_interval, Duration::from_secs),
            },
            delivery: DeliveryConfig {
                batch_size: file
                    .delivery
                    .batch_size
                    .unwrap_or(defaults.delivery.batch_size),
                batch_interval: file
                    .delivery
                    .batch_interval_ms
                    .map_or(defaults.delivery.batch_interval, Duration::from_millis),
                max_payload_size: file
                    .delivery
                    .max_payload_size
                    .unwrap_or(defaults.delivery.max_payload_size),
                max_duplicate_tracking: file
                    .delivery
                    .max_duplicate_tracking
                    .unwrap_or(defaults.delivery.max_duplicate_tracking),
                notice_buffer: file
                    .delivery
                    .notice_buffer
                    .unwrap_or(defaults.delivery.notice_buffer),
            },
            presence: PresenceConfig {
                heartbeat_interval: file
                    .presence
                    .heartbeat_interval_secs
                    .map_or(defaults.presence.heartbeat_interval, Duration::from_secs),
            },
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless peer-to-peer encrypted chat client")]
pub struct CliArgs {
    /// WebSocket URL of the signaling relay.
    #[arg(long, env = "PEERLINK_SIGNALING_URL")]
    pub signaling_url: Option<String>,

    /// Local peer identity (generated when omitted).
    #[arg(long, env = "PEERLINK_PEER_ID")]
    pub peer_id: Option<String>,

    /// Authenticated user id announced to the relay and the store.
    #[arg(long, env = "PEERLINK_USER_ID")]
    pub user_id: Option<String>,

    /// Remote peer to chat with.
    #[arg(long, env = "PEERLINK_REMOTE_PEER")]
    pub remote_peer: Option<String>,

    /// Path to config file (default: `~/.config/peerlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PEERLINK_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/peerlink.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist. Otherwise the default
/// path is tried and a missing file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("peerlink").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
