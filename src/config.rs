//! # Bridge configuration
//!
//! All tunables live in one TOML file at `~/.config/padlink/config.toml`.
//! Every section and field has a default, so a partial or missing file still
//! yields a usable configuration. Host and port can be overridden from the
//! command line after loading.
//!
//! ```toml
//! [peer]
//! host = "192.168.1.100"
//! port = 5555
//!
//! [transport]
//! ack_timeout_ms = 1000
//! retry_delay_ms = 200
//! max_retries = 5
//! connect_timeout_ms = 2000
//! reconnect_delay_ms = 2000
//! max_frame_len = 1048576
//!
//! [source]
//! poll_interval_ms = 30
//! joystick_deadzone = 0.05
//! ```

use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/padlink";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("Invalid transport setting: {0}")]
    InvalidTransport(String),

    #[error("Invalid source setting: {0}")]
    InvalidSource(String),
}

/// Where the consumer process listens
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 5555,
        }
    }
}

/// Timing and retry policy of the delivery channel
///
/// Defaults give a worst case of roughly six seconds before a single event is
/// given up on.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    /// How long one attempt waits for the matching ack
    pub ack_timeout_ms: u64,
    /// Pause between two attempts of the same envelope
    pub retry_delay_ms: u64,
    /// Total write attempts per envelope
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    /// Pause between failed connect attempts
    pub reconnect_delay_ms: u64,
    /// Largest frame body accepted from the peer
    pub max_frame_len: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1000,
            retry_delay_ms: 200,
            max_retries: 5,
            connect_timeout_ms: 2000,
            reconnect_delay_ms: 2000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Longest a single event may spend in the manager before it is dropped
    ///
    /// One ack wait plus one retry delay per allowed attempt.
    pub fn delivery_budget(&self) -> Duration {
        (self.ack_timeout() + self.retry_delay()) * self.max_retries
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidTransport(
                "max_retries must be at least 1".to_string(),
            ));
        }
        let durations = [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("retry_delay_ms", self.retry_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::InvalidTransport(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::InvalidTransport(
                "max_frame_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gamepad sampling
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SourceSettings {
    pub poll_interval_ms: u64,
    /// Analog stick deadzone as a fraction (0.0-1.0)
    pub joystick_deadzone: f32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30,
            joystick_deadzone: 0.05,
        }
    }
}

impl SourceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub peer: PeerConfig,
    pub transport: TransportSettings,
    pub source: SourceSettings,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.host.trim().is_empty() {
            return Err(ConfigError::InvalidPeer("host is empty".to_string()));
        }
        if self.peer.port == 0 {
            return Err(ConfigError::InvalidPeer("port must not be 0".to_string()));
        }
        self.transport.validate()?;
        if self.source.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSource(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.source.joystick_deadzone) {
            return Err(ConfigError::InvalidSource(format!(
                "joystick_deadzone {} outside [0.0, 1.0)",
                self.source.joystick_deadzone
            )));
        }
        Ok(())
    }

    /// Replaces host and/or port with command line values
    pub fn with_peer_override(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.peer.host = host;
        }
        if let Some(port) = port {
            self.peer.port = port;
        }
        self
    }

    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Writes the default configuration if no file exists yet
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            debug!("Config file {} already present", path.display());
            return Ok(());
        }
        info!("Creating default configuration at {}", path.display());
        Self::default().save(path).await
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
