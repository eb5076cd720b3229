//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the keys it changes.

mod chat;
mod server;

pub use chat::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "rateLimit": { "messageLimit": 5 },
///   "auth": { "tokens": { "dev-token": "alice" } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForemanSettings {
    /// Listener, heartbeat, and connection limits.
    pub server: ServerSettings,
    /// Message validation, context window, idle detection.
    pub chat: ChatSettings,
    /// Per-identity throttling.
    pub rate_limit: RateLimitSettings,
    /// Retry policy for the AI responder.
    pub responder: ResponderSettings,
    /// Durable store location.
    pub store: StoreSettings,
    /// Static bearer tokens.
    pub auth: AuthSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
    /// Defaults for the `chat` client subcommand.
    pub client: ClientSettings,
}

impl ForemanSettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason| Err(SettingsError::Invalid { field, reason });
        let server = &self.server;
        let rate = &self.rate_limit;

        if server.heartbeat_interval_secs == 0 {
            return invalid("server.heartbeatIntervalSecs", "must be positive");
        }
        if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
            return invalid(
                "server.heartbeatTimeoutSecs",
                "must be at least heartbeatIntervalSecs",
            );
        }
        if server.send_queue_capacity == 0 {
            return invalid("server.sendQueueCapacity", "must be positive");
        }
        if self.chat.max_content_chars == 0 {
            return invalid("chat.maxContentChars", "must be positive");
        }
        if self.chat.chunk_chars == 0 {
            return invalid("chat.chunkChars", "must be positive");
        }
        if rate.message_limit == 0 || rate.message_window_secs == 0 {
            return invalid("rateLimit.messageLimit", "limit and window must be positive");
        }
        if rate.read_limit == 0 || rate.read_window_secs == 0 {
            return invalid("rateLimit.readLimit", "limit and window must be positive");
        }
        Ok(())
    }
}
