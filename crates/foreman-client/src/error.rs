/// Errors raised by the client side of a chat session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The outbox is full. Nothing was dropped; the caller decides what to do.
    #[error("outbox full ({capacity} events queued)")]
    QueueFull { capacity: usize },

    /// The manager was disconnected on purpose and no longer accepts events.
    #[error("transport closed")]
    Closed,

    /// A WebSocket connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server URL could not be turned into a WebSocket URL.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// An HTTP request failed before a response arrived.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered an HTTP request with an error body.
    #[error("{status} {code}: {detail}")]
    Api {
        status: u16,
        code: String,
        detail: String,
    },

    /// A frame could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull { .. } | Self::Connect(_) | Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Closed | Self::InvalidUrl(_) | Self::Serialization(_) => false,
        }
    }
}
