//! Configuration module for the line relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(version = "0.1.0")]
#[command(about = "Relays every line a client sends to all other clients", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum line length in bytes, newline included
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Maximum number of simultaneous clients
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum number of simultaneous clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Framing and delivery limits
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Maximum line length in bytes, newline included
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Maximum bytes queued for a client that is not reading
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    200_000
}

fn default_max_pending_output() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub max_line_length: usize,
    pub max_pending_output: usize,
    pub log_level: String,
}

impl Config {
    /// Resolve configuration from parsed CLI args and the optional TOML file
    /// they point to.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            event_capacity: toml_config.server.event_capacity,
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.relay.max_line_length),
            max_pending_output: toml_config.relay.max_pending_output,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Socket address to listen on. `host` is a bare IPv4 or IPv6 address.
    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
