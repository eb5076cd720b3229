//! Chat protocol, throttling, and responder settings.

use serde::{Deserialize, Serialize};

/// Message validation and session housekeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    /// Longest accepted message, in characters.
    pub max_content_chars: usize,
    /// Most attachment references per message.
    pub max_attachments: usize,
    /// Prior completed turns handed to the responder.
    pub context_window_messages: u32,
    /// Seconds without activity before an active session is marked idle.
    pub idle_after_secs: u64,
    /// Seconds between idle sweeps.
    pub idle_sweep_interval_secs: u64,
    /// Characters per fragment when a single-value answer is chunked.
    pub chunk_chars: usize,
    /// Milliseconds between chunked fragments.
    pub chunk_pace_ms: u64,
    /// Seconds a session-less retry still deduplicates against the session
    /// its first message created.
    pub retry_window_secs: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_content_chars: 10_000,
            max_attachments: 10,
            context_window_messages: 20,
            idle_after_secs: 900,
            idle_sweep_interval_secs: 60,
            chunk_chars: 48,
            chunk_pace_ms: 0,
            retry_window_secs: 600,
        }
    }
}

/// Sliding-window limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Messages admitted per identity per window.
    pub message_limit: u32,
    /// Message window length in seconds.
    pub message_window_secs: u64,
    /// Query-surface requests per identity per window.
    pub read_limit: u32,
    /// Read window length in seconds.
    pub read_window_secs: u64,
    /// Seconds between purges of idle counters.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            message_limit: 20,
            message_window_secs: 60,
            read_limit: 120,
            read_window_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

/// Retry policy for calls to the AI responder.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponderSettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Pace of the development echo responder, in milliseconds per word.
    pub echo_pace_ms: u64,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            echo_pace_ms: 40,
        }
    }
}
