//! Configuration management

use crate::obfuscation::{XorObfuscator, DEFAULT_KEY};
use crate::tunnel::{ChannelSettings, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.server.validate()
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// XOR key shared with the peer
    pub obfuscation_key: u8,
    /// Destination connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Destination read timeout in seconds
    pub read_timeout_secs: u64,
    /// Relay buffer size in bytes, including the 4 header bytes
    pub relay_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let channel = ChannelSettings::default();
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            obfuscation_key: DEFAULT_KEY,
            connect_timeout_secs: channel.connect_timeout.as_secs(),
            read_timeout_secs: channel.read_timeout.as_secs(),
            relay_buffer_size: channel.relay_buffer_size,
        }
    }
}

impl ServerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.connect_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "read_timeout_secs must be positive".to_string(),
            ));
        }
        let max_buffer = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE;
        if self.relay_buffer_size <= FRAME_HEADER_SIZE || self.relay_buffer_size > max_buffer {
            return Err(crate::Error::Config(format!(
                "relay_buffer_size must be in {}..={}",
                FRAME_HEADER_SIZE + 1,
                max_buffer
            )));
        }
        Ok(())
    }

    /// Obfuscation transform for the physical connection
    pub fn obfuscator(&self) -> XorObfuscator {
        XorObfuscator::new(self.obfuscation_key)
    }

    /// Per-channel settings
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            relay_buffer_size: self.relay_buffer_size,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
