//! Server configuration.

use std::time::Duration;

use foreman_settings::ForemanSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the Foreman server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any inbound frame.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// How long shutdown waits for connection tasks.
    pub shutdown_timeout_secs: u64,
    /// Inactivity before an active session is marked idle.
    pub idle_after_secs: u64,
    /// Period of the idle sweep.
    pub idle_sweep_interval_secs: u64,
    /// Period of the rate-window purge.
    pub counter_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            shutdown_timeout_secs: 10,
            idle_after_secs: 900,
            idle_sweep_interval_secs: 60,
            counter_sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Derive the listener configuration from loaded settings.
    pub fn from_settings(settings: &ForemanSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
            heartbeat_timeout_secs: server.heartbeat_timeout_secs,
            send_queue_capacity: server.send_queue_capacity,
            shutdown_timeout_secs: server.shutdown_timeout_secs,
            idle_after_secs: settings.chat.idle_after_secs,
            idle_sweep_interval_secs: settings.chat.idle_sweep_interval_secs,
            counter_sweep_interval_secs: settings.rate_limit.sweep_interval_secs,
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Limits applied by the session orchestrator.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Longest accepted message, in characters.
    pub max_content_chars: usize,
    /// Most attachment references per message.
    pub max_attachments: usize,
    /// Completed turns handed to the responder as context.
    pub context_window_messages: u32,
    /// How long a session-less retry may still find the session its first
    /// message created.
    pub retry_window: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 10_000,
            max_attachments: 10,
            context_window_messages: 20,
            retry_window: Duration::from_secs(600),
        }
    }
}

impl ChatConfig {
    pub fn from_settings(settings: &ForemanSettings) -> Self {
        Self {
            max_content_chars: settings.chat.max_content_chars,
            max_attachments: settings.chat.max_attachments,
            context_window_messages: settings.chat.context_window_messages,
            retry_window: Duration::from_secs(settings.chat.retry_window_secs),
        }
    }
}
