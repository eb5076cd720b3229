use std::time::Duration;

/// Errors surfaced to chat clients.
///
/// Validation and rate-limit failures are resolved at the orchestrator
/// boundary and returned to the caller synchronously. Responder failures are
/// folded into an errored assistant message. Transport failures never reach
/// the orchestrator; they only exist on the client side.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Malformed or oversized input. User-correctable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The identity exceeded its message budget for the current window.
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Unknown session or message, or one owned by another identity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The session was closed and no longer accepts messages.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The AI responder failed.
    #[error("responder failure: {0}")]
    ResponderFailure(String),

    /// The connection broke.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Persistence or other server-side fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable wire code, sent in `error` events and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SessionClosed(_) => "SESSION_CLOSED",
            Self::ResponderFailure(_) => "RESPONDER_FAILURE",
            Self::TransportFailure(_) => "TRANSPORT_FAILURE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the client should back off and try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransportFailure(_))
    }
}

/// Typed error hierarchy for the external AI responder.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResponderError {
    /// The responder is temporarily unavailable or overloaded.
    #[error("responder unavailable: {0}")]
    Unavailable(String),
    /// The responder throttled us.
    #[error("responder rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// The fragment stream broke after it started.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    /// The request was rejected and must not be retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Unclassified failure inside the responder.
    #[error("internal responder error: {0}")]
    Internal(String),
    /// The call exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ResponderError {
    /// Whether issuing the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// Server-suggested delay before retrying, if any.
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging and metrics labels.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<ResponderError> for ChatError {
    fn from(e: ResponderError) -> Self {
        Self::ResponderFailure(e.to_string())
    }
}

/// Identity verification failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credentials were presented.
    #[error("missing credentials")]
    MissingCredentials,
    /// Credentials were presented but rejected.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The verifier itself could not be reached.
    #[error("identity verifier unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for ChatError {
    fn from(e: AuthError) -> Self {
        Self::Unauthorized(e.to_string())
    }
}
