//! Configuration module for compute-mux.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "compute-mux")]
#[command(author = "compute-mux authors")]
#[command(version = "0.1.0")]
#[command(about = "Control/compute server with on-demand data channels", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control listener address (e.g., 0.0.0.0:3000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneously registered connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Address that provisioned data channels bind to
    #[arg(long)]
    pub bind_host: Option<String>,

    /// Stream channels are searched in base+1 ..= base+range
    #[arg(long)]
    pub stream_port_base: Option<u16>,

    /// Datagram channels are searched in base+1 ..= base+range
    #[arg(long)]
    pub datagram_port_base: Option<u16>,

    /// Number of ports searched above each base
    #[arg(long)]
    pub port_range: Option<u16>,

    /// Deadline for a partially received stream frame (0 = none)
    #[arg(long)]
    pub frame_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the control listener to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Connection registry capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Data channel provisioning configuration
#[derive(Debug, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_stream_port_base")]
    pub stream_port_base: u16,
    #[serde(default = "default_datagram_port_base")]
    pub datagram_port_base: u16,
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            stream_port_base: default_stream_port_base(),
            datagram_port_base: default_datagram_port_base(),
            port_range: default_port_range(),
            frame_timeout_ms: default_frame_timeout_ms(),
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

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_connections() -> usize {
    30
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_stream_port_base() -> u16 {
    6000
}

fn default_datagram_port_base() -> u16 {
    7000
}

fn default_port_range() -> u16 {
    999
}

fn default_frame_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub bind_host: IpAddr,
    pub stream_port_base: u16,
    pub datagram_port_base: u16,
    pub port_range: u16,
    /// `None` when partial frames may wait forever.
    pub frame_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid("listen", listen.clone()))?;

        let bind_host = cli.bind_host.unwrap_or(toml_config.channels.bind_host);
        let bind_host: IpAddr = bind_host
            .parse()
            .map_err(|_| ConfigError::Invalid("bind_host", bind_host.clone()))?;

        let frame_timeout_ms = cli
            .frame_timeout_ms
            .unwrap_or(toml_config.channels.frame_timeout_ms);

        let config = Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            bind_host,
            stream_port_base: cli
                .stream_port_base
                .unwrap_or(toml_config.channels.stream_port_base),
            datagram_port_base: cli
                .datagram_port_base
                .unwrap_or(toml_config.channels.datagram_port_base),
            port_range: cli.port_range.unwrap_or(toml_config.channels.port_range),
            frame_timeout: (frame_timeout_ms > 0).then(|| Duration::from_millis(frame_timeout_ms)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections", "0".to_string()));
        }
        if self.port_range == 0 {
            return Err(ConfigError::Invalid("port_range", "0".to_string()));
        }
        for (field, base) in [
            ("stream_port_base", self.stream_port_base),
            ("datagram_port_base", self.datagram_port_base),
        ] {
            if u32::from(base) + u32::from(self.port_range) > u32::from(u16::MAX) {
                return Err(ConfigError::Invalid(field, base.to_string()));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {0}: '{1}'")]
    Invalid(&'static str, String),
}
