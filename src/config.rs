//! Configuration management for the stratum bridge
//!
//! Values come from a YAML file, then `KSBRIDGE_*` environment variables,
//! then command line flags, each overriding the previous layer.

use crate::error::{Error, Result};
use crate::node::http::node_url;
use crate::stratum::extranonce::MAX_EXTRANONCE_SIZE;
use crate::stratum::Network;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Shortest allowed fallback polling interval
pub const MIN_BLOCK_WAIT_TIME: Duration = Duration::from_secs(3);

/// Share difficulty used when the configured one is zero
pub const FALLBACK_SHARE_DIFF: f64 = 0.1;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "KSBRIDGE";

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(level)
    }
}

/// Console log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Plain,
    /// One JSON object per line
    Json,
}

/// Command line arguments
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "karlsen-stratum-bridge",
    version = env!("CARGO_PKG_VERSION"),
    about = "Stratum bridge between miners and a Karlsen node"
)]
pub struct Args {
    /// Configuration file path (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "KSBRIDGE_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub print_config: bool,

    /// Stratum listen address, e.g. `:5555`
    #[arg(long)]
    pub stratum_port: Option<String>,

    /// karlsend RPC address
    #[arg(long)]
    pub karlsend_address: Option<String>,

    /// Health check listen address, disabled when empty
    #[arg(long)]
    pub health_check_port: Option<String>,

    /// Fallback polling interval for new templates
    #[arg(long, value_parser = humantime::parse_duration)]
    pub block_wait_time: Option<Duration>,

    /// Difficulty announced to miners
    #[arg(long)]
    pub min_share_diff: Option<f64>,

    /// Extranonce size in bytes (0-3)
    #[arg(long)]
    pub extranonce_size: Option<u8>,

    /// Mine on testnet
    #[arg(long)]
    pub testnet_mining: bool,

    /// Also write logs to bridge.log
    #[arg(long)]
    pub log_to_file: bool,

    /// Log level
    #[arg(short = 'l', long)]
    pub log_level: Option<LogLevel>,

    /// Log format
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

/// Effective bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub stratum_port: String,
    pub karlsend_address: String,
    pub health_check_port: String,
    pub print_stats: bool,
    pub log_to_file: bool,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    #[serde(with = "duration_str")]
    pub block_wait_time: Duration,
    pub min_share_diff: f64,
    pub extranonce_size: u8,
    pub testnet_mining: bool,
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
    #[serde(with = "duration_str")]
    pub reconnect_backoff: Duration,
    #[serde(with = "duration_str")]
    pub reconnect_jitter: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stratum_port: ":5555".to_string(),
            karlsend_address: "localhost:42110".to_string(),
            health_check_port: String::new(),
            print_stats: true,
            log_to_file: false,
            log_level: LogLevel::Info,
            log_format: LogFormat::Plain,
            block_wait_time: MIN_BLOCK_WAIT_TIME,
            min_share_diff: 4.0,
            extranonce_size: 0,
            testnet_mining: false,
            rpc_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
            reconnect_jitter: Duration::ZERO,
        }
    }
}

impl BridgeConfig {
    /// Load, normalize and validate the configuration for `args`
    pub fn load(args: &Args) -> Result<Self> {
        let config = Self::from_sources(args.config_file.as_ref())?
            .with_args(args)
            .normalized();
        config.validate()?;
        Ok(config)
    }

    /// Read the file (if any) and the environment
    pub fn from_sources(path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config(format!("failed to load configuration: {}", e)))
    }

    /// Apply command line overrides
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(port) = &args.stratum_port {
            self.stratum_port = port.clone();
        }
        if let Some(address) = &args.karlsend_address {
            self.karlsend_address = address.clone();
        }
        if let Some(port) = &args.health_check_port {
            self.health_check_port = port.clone();
        }
        if let Some(wait) = args.block_wait_time {
            self.block_wait_time = wait;
        }
        if let Some(diff) = args.min_share_diff {
            self.min_share_diff = diff;
        }
        if let Some(size) = args.extranonce_size {
            self.extranonce_size = size;
        }
        if let Some(level) = args.log_level {
            self.log_level = level;
        }
        if let Some(format) = args.log_format {
            self.log_format = format;
        }
        self.testnet_mining |= args.testnet_mining;
        self.log_to_file |= args.log_to_file;
        self
    }

    /// Substitute fallbacks for zero values and clamp the extranonce size
    pub fn normalized(mut self) -> Self {
        if self.block_wait_time.is_zero() {
            self.block_wait_time = MIN_BLOCK_WAIT_TIME;
        }
        if self.min_share_diff == 0.0 {
            self.min_share_diff = FALLBACK_SHARE_DIFF;
        }
        self.extranonce_size = self.extranonce_size.min(MAX_EXTRANONCE_SIZE);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.karlsend_address.trim().is_empty() {
            return Err(Error::config("karlsend_address must not be empty"));
        }
        node_url(&self.karlsend_address)?;
        listen_addr(&self.stratum_port)?;
        if !self.health_check_port.is_empty() {
            listen_addr(&self.health_check_port)?;
        }
        if !self.min_share_diff.is_finite() || self.min_share_diff < 0.0 {
            return Err(Error::config(format!(
                "min_share_diff must be a positive number, got {}",
                self.min_share_diff
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(Error::config("rpc_timeout must be greater than 0"));
        }
        Ok(())
    }

    /// Address network selected by `testnet_mining`
    pub fn network(&self) -> Network {
        Network::from_testnet_flag(self.testnet_mining)
    }

    /// Socket address of the stratum listener
    pub fn stratum_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.stratum_port)
    }

    /// Socket address of the health check, if enabled
    pub fn health_check_addr(&self) -> Result<Option<SocketAddr>> {
        if self.health_check_port.is_empty() {
            return Ok(None);
        }
        listen_addr(&self.health_check_port).map(Some)
    }
}

/// Parse a listen address; a bare `:port` binds all interfaces
pub fn listen_addr(port: &str) -> Result<SocketAddr> {
    let full = if port.starts_with(':') {
        format!("0.0.0.0{}", port)
    } else {
        port.to_string()
    };
    full.parse()
        .map_err(|e| Error::config(format!("invalid listen address {}: {}", port, e)))
}

/// humantime formatted durations, e.g. `3s` or `500ms`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
