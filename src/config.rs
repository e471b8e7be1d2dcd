//! Configuration module for proactor-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "proactor-server")]
#[command(author = "proactor-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server dispatching socket I/O to a worker pool", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of tasks waiting for a worker
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum number of readiness events reported per wait
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Read chunk size and initial buffer size per connection, in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Application protocol
    #[arg(short, long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Application protocol served to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Echo every byte back
    #[default]
    Echo,
    /// PING/PONG line protocol
    Ping,
}

/// Fate of queued work at shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Finish queued tasks before stopping
    #[default]
    Drain,
    /// Drop queued tasks and close their connections
    Discard,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Number of worker threads
    #[serde(default)]
    pub workers: usize,
    /// Worker queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Application protocol
    #[serde(default)]
    pub protocol: ProtocolType,
    /// What to do with queued tasks at shutdown
    #[serde(default)]
    pub shutdown_policy: ShutdownMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            workers: 0,
            queue_capacity: default_queue_capacity(),
            protocol: ProtocolType::default(),
            shutdown_policy: ShutdownMode::default(),
        }
    }
}

/// Capacity limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum readiness events per wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Read chunk size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_events: default_max_events(),
            buffer_size: default_buffer_size(),
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
    "0.0.0.0".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_connections() -> usize {
    65_535
}

fn default_max_events() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 0 = number of CPU cores
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_connections: usize,
    pub max_events: usize,
    pub buffer_size: usize,
    pub protocol: ProtocolType,
    pub shutdown_policy: ShutdownMode,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::for_port(0), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    ///
    /// A missing or non-numeric port prints usage and exits the process.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against their config file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.server.queue_capacity),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.limits.max_connections),
            max_events: cli.max_events.unwrap_or(toml_config.limits.max_events),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.limits.buffer_size),
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            shutdown_policy: toml_config.server.shutdown_policy,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("queue_capacity", self.queue_capacity),
            ("max_connections", self.max_connections),
            ("max_events", self.max_events),
            ("buffer_size", self.buffer_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }
        self.listen_addr().map(|_| ())
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Worker thread count with 0 resolved to the available parallelism.
    pub fn worker_threads(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }
}

impl CliArgs {
    fn for_port(port: u16) -> Self {
        CliArgs {
            port,
            config: None,
            host: None,
            workers: None,
            queue_capacity: None,
            max_connections: None,
            max_events: None,
            buffer_size: None,
            protocol: None,
            log_level: default_log_level(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidHost(host) => write!(f, "Invalid host address '{host}'"),
            ConfigError::Invalid(name, reason) => write!(f, "Invalid {name}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
