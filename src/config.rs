//! Configuration for wsline.
//!
//! This module provides TOML configuration loading from
//! `~/.wsline/config.toml` or an explicit path given on the command line.
//!
//! # Configuration File
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4000"
//! protocol = "ascii"
//!
//! [terminal]
//! width = 80
//! prompt_width = 2
//!
//! [output]
//! max_chunk = 2048
//! send_queue = 64
//!
//! [log]
//! level = "info"
//! file = "/var/log/wsline.log"
//!
//! [talker]
//! name = "wsline"
//! prompt = "> "
//! motd = "Welcome!"
//! ```
//!
//! Every section and key is optional; missing values take their defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub output: OutputConfig,
    pub log: LogConfig,
    pub talker: TalkerConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address to accept WebSocket connections on
    pub listen: String,
    /// WebSocket sub-protocol served by the bridge
    pub protocol: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4000".to_string(),
            protocol: "ascii".to_string(),
        }
    }
}

/// Remote terminal geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Display width in columns
    pub width: u16,
    /// Columns reserved for the prompt
    pub prompt_width: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            width: 80,
            prompt_width: 2,
        }
    }
}

impl TerminalConfig {
    /// Columns available to the input line
    pub fn cols(&self) -> usize {
        usize::from(self.width.saturating_sub(self.prompt_width)).max(1)
    }
}

/// Output flow control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Maximum bytes per transport write
    pub max_chunk: usize,
    /// Frames buffered toward the socket before writes would block
    pub send_queue: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_chunk: 2048,
            send_queue: 64,
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Append to this file instead of writing to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Demo talker host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkerConfig {
    pub name: String,
    pub prompt: String,
    pub motd: String,
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            name: "wsline".to_string(),
            prompt: "> ".to_string(),
            motd: "Welcome!".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// A missing or broken default file yields the defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                if let Ok(config) = Self::load_from(&path) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".wsline").join("config.toml"))
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
