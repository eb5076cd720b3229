//! Server, store, auth, logging, and client settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Listener and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port.
    pub port: u16,
    /// Seconds between heartbeat pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without any inbound frame before a connection is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection. A transport whose queue
    /// fills is closed so its client re-syncs.
    pub send_queue_capacity: usize,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds to wait for connection tasks during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_queue_capacity: 256,
            max_connections: 1_000,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Durable store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite file. Relative paths resolve under `~/.foreman`.
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: "foreman.db".to_string(),
        }
    }
}

/// Static bearer-token authentication.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Token → identity.
    pub tokens: BTreeMap<String, String>,
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for terminals.
    Pretty,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Per-module level overrides, e.g. `{"foreman_store": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            module_levels: BTreeMap::new(),
        }
    }
}

/// Defaults for the interactive client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Base URL of the server (`http://` or `https://`).
    pub server_url: String,
    /// Events buffered while disconnected.
    pub outbox_capacity: usize,
    /// First reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
    /// Consecutive failed reconnects before giving up.
    pub max_reconnect_attempts: u32,
    /// How long a typing indicator stays on without a refresh.
    pub typing_ttl_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8787".to_string(),
            outbox_capacity: 64,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 10,
            typing_ttl_ms: 3_000,
        }
    }
}
