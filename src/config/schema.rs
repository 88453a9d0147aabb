//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the channel
//! layer. All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    /// Inbound endpoints.
    pub listeners: Vec<ListenerConfig>,

    /// Outbound endpoints.
    pub connectors: Vec<ConnectorConfig>,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Name used in logs and metric labels.
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:20000").
    pub bind_address: String,

    /// Optional TLS configuration. Plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent sessions (backpressure).
    pub max_connections: usize,

    /// Upper bound for a TLS handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "listener".to_string(),
            bind_address: "0.0.0.0:20000".to_string(),
            tls: None,
            max_connections: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ListenerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Connector configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Name used in logs and metric labels.
    pub name: String,

    /// Default remote address (e.g., "10.0.0.5:20000").
    pub remote_address: String,

    /// Optional TLS configuration. Plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// Upper bound for TCP connection establishment, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Upper bound for a TLS handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "connector".to_string(),
            remote_address: "127.0.0.1:20000".to_string(),
            tls: None,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ConnectorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// TLS material and protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Local certificate chain, leaf first (PEM).
    pub cert_path: PathBuf,

    /// Private key for the leaf certificate (PEM).
    pub key_path: PathBuf,

    /// Trusted CA certificates used to verify the peer (PEM).
    pub ca_path: PathBuf,

    /// Name expected in the server certificate (connectors only).
    pub server_name: Option<String>,

    /// Allow TLS 1.2.
    pub allow_tls12: bool,

    /// Allow TLS 1.3.
    pub allow_tls13: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            ca_path: PathBuf::new(),
            server_name: None,
            allow_tls12: true,
            allow_tls13: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub log_filter: String,

    /// Human-readable or JSON logs.
    pub log_format: LogFormat,

    /// Expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Prometheus scrape address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "dnp3_channel=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}
