//! Relay settings: bind address, frame size limit and log filter.
//!
//! Each value comes from the command line (or its environment variable),
//! then `~/.config/peerlink-relay/config.toml`, then the built-in default.
//! The file holds top-level keys only:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9000"
//! max_message_size = 65536
//! ```

use std::path::{Path, PathBuf};

/// Default cap on a single signaling frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors that can occur when loading relay configuration.
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

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayFile {
    bind_addr: Option<String>,
    max_message_size: Option<usize>,
}

/// CLI arguments for the relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "PeerLink signaling relay")]
pub struct RelayCliArgs {
    /// Address to bind the relay to.
    #[arg(short, long, env = "PEERLINK_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Config file to read instead of the default location.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Reject signaling frames larger than this many bytes.
    #[arg(long, env = "PEERLINK_RELAY_MAX_MESSAGE_SIZE")]
    pub max_message_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PEERLINK_RELAY_LOG")]
    pub log_level: String,
}

/// Resolved relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Frames above this size close the sender's socket.
    pub max_message_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Build the settings from `cli` and the config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit `--config` file is missing, or
    /// if any config file cannot be read or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = read_file(cli.config.as_deref())?;
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: &RelayCliArgs, file: RelayFile) -> Self {
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.bind_addr)
                .unwrap_or_else(|| "0.0.0.0:9000".to_string()),
            max_message_size: cli
                .max_message_size
                .or(file.max_message_size)
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            log_level: cli.log_level.clone(),
        }
    }
}

fn read_file(explicit: Option<&Path>) -> Result<RelayFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("peerlink-relay").join("config.toml"), false),
            None => return Ok(RelayFile::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(RelayFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
