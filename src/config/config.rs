use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::logging_config::LoggingConfig;
use crate::directory::PeerDirectory;
use crate::models::{LocalIdentity, Peer};
use crate::pool::PoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid AE title: {0}")]
    InvalidAeTitle(String),

    #[error("Invalid hostname {0}")]
    InvalidHostname(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),

    #[error("Max PDU size {0} is outside 4096..=131072")]
    InvalidPduSize(u32),

    #[error("Peer id '{0}' is defined more than once")]
    DuplicatePeer(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Everything read from the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub local: LocalIdentity,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read, parse and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_str(&text)?;
        info!(
            "Loaded configuration from {} ({} peers)",
            path.display(),
            config.peers.len()
        );
        Ok(config)
    }

    /// Parse and validate TOML text
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the local identity and every peer; the first problem wins
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            peer.validate()?;
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.id.clone()));
            }
        }
        Ok(())
    }
}

impl PeerDirectory for Config {
    fn local_identity(&self) -> LocalIdentity {
        self.local.clone()
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }
}
