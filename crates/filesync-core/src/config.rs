//! Configuration for FileSync
//!
//! TOML file with per-section defaults, loaded from:
//! - macOS: ~/Library/Application Support/com.filesync.filesync/config.toml
//! - Linux: ~/.config/filesync/config.toml
//! - Windows: %APPDATA%/filesync/filesync/config/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::SessionOptions;
use crate::{DEFAULT_BLOCK_SIZE, MAX_FRAME_SIZE};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sending side settings
    pub transfer: TransferConfig,
    /// Socket settings
    pub network: NetworkConfig,
    /// Receiving side settings
    pub receive: ReceiveConfig,
}

/// Sending side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Wire size of a data block, including the 4-byte session id
    pub block_size: usize,
    /// Encrypt frames when a pairing code is in use
    pub encrypt: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            encrypt: false,
        }
    }
}

impl TransferConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::with_block_size(self.block_size)
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listening port for `receive`
    pub port: u16,
    /// Bind address for `receive`
    pub bind: IpAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Largest frame body accepted from a peer
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 7878,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout_secs: 10,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Receiving side configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Where received files land (current directory if unset)
    pub download_dir: Option<PathBuf>,
    /// Replace existing files instead of picking a fresh name
    pub overwrite: bool,
}

impl ReceiveConfig {
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "filesync", "filesync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transfer.block_size, 64 * 1024);
        assert!(!config.transfer.encrypt);
        assert_eq!(config.network.port, 7878);
        assert_eq!(config.network.max_frame_size, 16 * 1024 * 1024);
        assert!(!config.receive.overwrite);
        assert_eq!(config.receive.download_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [transfer]
            block_size = 1024
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transfer.block_size, 1024);
        assert_eq!(config.transfer.session_options().payload_capacity(), 1020);
        // Other values should be defaults
        assert_eq!(config.network.port, 7878);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[transfer]"));
        assert!(sample.contains("[network]"));
        assert!(sample.contains("[receive]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.network.port, 7878);
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        let mut config = Config::default();
        config.network.port = 9000;
        config.receive.download_dir = Some(temp.path().join("inbox"));
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[network]\nport = \"many\"").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_listen_addr() {
        let mut network = NetworkConfig::default();
        network.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        network.port = 1234;
        assert_eq!(network.listen_addr().to_string(), "127.0.0.1:1234");
        assert_eq!(network.connect_timeout(), Duration::from_secs(10));
    }
}
