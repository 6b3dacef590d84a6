//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the pool.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Pool sizing, recovery and health settings.
    pub pool: PoolConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Backing service host, probed by the health watcher.
    pub host: String,

    /// Backing service port.
    pub port: u16,

    /// Maximum simultaneous connections.
    pub capacity: usize,

    /// Retire defunct connections whenever an error is raised.
    pub auto_recover: bool,

    /// Cancel the remote work of retired connections through a healthy one.
    pub auto_cancel: bool,

    /// Delay between liveness probes while the watcher runs, in milliseconds.
    pub reconnect_interval_ms: u64,

    /// Default maximum idle-since-lease duration, in milliseconds.
    pub idle_timeout_ms: Option<u64>,

    /// Maximum time a checkout may wait in the pending queue, in milliseconds.
    pub checkout_timeout_ms: Option<u64>,

    /// Liveness probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
}

impl PoolConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            capacity: 10,
            auto_recover: false,
            auto_cancel: false,
            reconnect_interval_ms: 5000,
            idle_timeout_ms: None,
            checkout_timeout_ms: None,
            probe_timeout_ms: 1000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
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
    /// Log level filter (trace, debug, info, warn, error or a directive list).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9187".to_string(),
        }
    }
}
