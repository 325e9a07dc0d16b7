use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(RelayError::Config(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

impl std::str::FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(RelayError::Config(format!(
                "Invalid log format: {}. Must be one of: text, json",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

/// Settings for the external tunnel binary and its local status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Name or path of the external tunneling binary.
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    /// Port of the binary's local status API.
    #[serde(default = "default_tunnel_api_port")]
    pub api_port: u16,
}

fn default_tunnel_binary() -> String {
    "ngrok".to_string()
}

fn default_tunnel_api_port() -> u16 {
    4040
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: default_tunnel_binary(),
            api_port: default_tunnel_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Timeout applied to each outbound request to a relay target.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// How many request log records the in-memory sink retains.
    #[serde(default = "default_log_buffer_capacity")]
    pub log_buffer_capacity: usize,
    /// Optional JSON-lines file that additionally receives every log record.
    #[serde(default)]
    pub request_log_file: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("default listen address")
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_log_buffer_capacity() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            log_buffer_capacity: default_log_buffer_capacity(),
            request_log_file: None,
            logging: LoggingConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse {}: {}", path, e)))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RelayError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies environment overrides on top of whatever was loaded.
    pub fn apply_env(&mut self) -> Result<(), RelayError> {
        if let Ok(port) = std::env::var("RELAY_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| RelayError::Config(format!("Invalid RELAY_PORT: {}", port)))?;
            self.listen_addr.set_port(port);
        }
        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.logging.level = level.parse()?;
        }
        Ok(())
    }
}
