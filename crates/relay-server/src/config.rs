//! Node configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CHAT_HOST, CHAT_PORT, CHAT_BUS_URL)
//! - TOML configuration file
//! - An explicit `--config` path

use anyhow::{bail, Context, Result};
use chat_relay_transport::{TcpBusConfig, TcpConfig};
use relay_protocol::HeaderRetry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file locations, searched in order.
const CONFIG_PATHS: [&str; 3] = [
    "chatd.toml",
    "/etc/chatd/chatd.toml",
    "~/.config/chatd/chatd.toml",
];

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind the chat listener to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Chat listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Header read retry policy.
    #[serde(default)]
    pub read: ReadConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// HTTP admin endpoint.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `memory` for a single-node bus, or `tcp://host:port` for a hub.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Subject carrying chat traffic.
    #[serde(default = "default_subject")]
    pub subject: String,

    /// Wait between hub reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_ms: u64,

    /// Hub connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Frames queued for the hub before publishing fails.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Header read retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Header read attempts.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Backoff unit in milliseconds; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Messages queued per client before sends to it fail.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// HTTP admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Where the bus lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTarget {
    /// In-process bus.
    Memory,
    /// Hub at `host:port`.
    Tcp(String),
}

// Default value functions
fn default_host() -> String {
    std::env::var("CHAT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("CHAT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6000)
}

fn default_bus_url() -> String {
    std::env::var("CHAT_BUS_URL").unwrap_or_else(|_| "memory".to_string())
}

fn default_subject() -> String {
    chat_relay_core::router::DEFAULT_SUBJECT.to_string()
}

fn default_reconnect_wait() -> u64 {
    2_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retries() -> u32 {
    HeaderRetry::DEFAULT_ATTEMPTS
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_admin_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bus: BusConfig::default(),
            read: ReadConfig::default(),
            limits: LimitsConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            subject: default_subject(),
            reconnect_wait_ms: default_reconnect_wait(),
            connect_timeout_ms: default_connect_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_base_ms: default_backoff_base(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path` if given, else from the default
    /// locations, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// explicit path cannot be read.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind the chat listener to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the socket address for the admin endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        let mut addr = self.bind_addr()?;
        addr.set_port(self.admin.port);
        Ok(addr)
    }

    /// Parse the bus URL.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than `memory` or
    /// `tcp://host:port`.
    pub fn bus_target(&self) -> Result<BusTarget> {
        let url = self.bus.url.trim();
        if url == "memory" {
            return Ok(BusTarget::Memory);
        }
        match url.strip_prefix("tcp://") {
            Some(addr) if !addr.is_empty() => Ok(BusTarget::Tcp(addr.to_string())),
            _ => bail!("Unsupported bus url: {}", self.bus.url),
        }
    }

    /// Header read retry policy.
    #[must_use]
    pub fn header_retry(&self) -> HeaderRetry {
        HeaderRetry::new(
            self.read.retries,
            Duration::from_millis(self.read.backoff_base_ms),
        )
    }

    /// Chat listener configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn tcp_config(&self) -> Result<TcpConfig> {
        Ok(TcpConfig {
            bind_addr: self.bind_addr()?,
            max_connections: self.limits.max_connections,
            outbound_queue: self.limits.outbound_queue,
            header_retry: self.header_retry(),
        })
    }

    /// Bus link configuration for a hub at `addr`.
    #[must_use]
    pub fn tcp_bus_config(&self, addr: String) -> TcpBusConfig {
        TcpBusConfig {
            addr,
            connect_timeout: Duration::from_millis(self.bus.connect_timeout_ms),
            reconnect_wait: Duration::from_millis(self.bus.reconnect_wait_ms),
            queue_capacity: self.bus.queue_capacity,
            ..Default::default()
        }
    }
}
