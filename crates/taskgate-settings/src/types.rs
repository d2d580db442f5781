//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a
//! settings file may supply any subset of fields; missing fields keep
//! their production default.

use serde::{Deserialize, Serialize};

/// Root settings type for the gateway.
///
/// # JSON format
///
/// ```json
/// {
///   "server": { "port": 8888 },
///   "bus": { "keyPrefix": "RA_", "maxChannels": 16 },
///   "query": { "keepaliveIntervalMs": 10000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Backend bus settings.
    pub bus: BusSettings,
    /// Task query settings.
    pub query: QuerySettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}

/// Backend bus and key/value settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Prefix applied to every derived key and channel name.
    pub key_prefix: String,
    /// Logical channel capacity of one pooled bus connection.
    pub max_channels: usize,
    /// Idle keep-alive ping interval in seconds (while a connection has
    /// zero subscriptions).
    pub ping_interval_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            key_prefix: "RA_".to_string(),
            max_channels: 16,
            ping_interval_secs: 60,
        }
    }
}

/// Task query settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySettings {
    /// Allow-list pattern a task id must match.
    pub task_id_pattern: String,
    /// Maximum accepted task id length.
    pub max_task_id_length: usize,
    /// Interval between keep-alive whitespace writes on an open watch
    /// response, in milliseconds. `0` disables the keep-alive.
    pub keepalive_interval_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            task_id_pattern: "^[A-Za-z0-9_]+$".to_string(),
            max_task_id_length: 32,
            keepalive_interval_ms: 10_000,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
