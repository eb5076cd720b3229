use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use foreman_core::Identity;

use crate::store::{Admission, CounterStore};

/// Which path is being throttled. Decides what happens when the counter store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Query surface. Admits when the store is unreachable.
    Read,
    /// Message submission. Rejects when the store is unreachable.
    Submit,
}

impl LimitScope {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Submit => "submit",
        }
    }

    fn key(self, identity: &Identity) -> String {
        match self {
            Self::Read => format!("read:{identity}"),
            Self::Submit => format!("submit:{identity}"),
        }
    }
}

/// Outcome of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// The store failed and the scope's fallback policy decided.
    pub degraded: bool,
    /// Suggested wait before retrying. Zero when admitted.
    pub retry_after: Duration,
}

/// Limits for both scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSettings {
    pub message_limit: u32,
    pub message_window: Duration,
    pub read_limit: u32,
    pub read_window: Duration,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            message_limit: 20,
            message_window: Duration::from_secs(60),
            read_limit: 120,
            read_window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window limiter over a [`CounterStore`].
///
/// Store failures are handled asymmetrically on purpose: reads fail open so
/// history stays available during a counter outage, while submissions fail
/// closed so an outage never turns into unthrottled writes and responder spend.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    settings: LimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, settings: LimitSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LimitSettings {
        &self.settings
    }

    /// Try to admit one action for `identity` against an explicit limit.
    pub async fn try_acquire(
        &self,
        identity: &Identity,
        limit: u32,
        window: Duration,
        scope: LimitScope,
    ) -> Decision {
        let key = scope.key(identity);
        match self.store.admit(&key, Instant::now(), window, limit).await {
            Ok(Admission::Admitted) => Decision {
                admitted: true,
                degraded: false,
                retry_after: Duration::ZERO,
            },
            Ok(Admission::Rejected { retry_after }) => Decision {
                admitted: false,
                degraded: false,
                retry_after,
            },
            Err(error) => {
                let admitted = scope == LimitScope::Read;
                warn!(
                    identity = %identity,
                    scope = ?scope,
                    admitted,
                    error = %error,
                    "counter store failed; applying fallback policy"
                );
                Decision {
                    admitted,
                    degraded: true,
                    retry_after: if admitted { Duration::ZERO } else { window },
                }
            }
        }
    }

    /// Apply the configured message-submission limit.
    pub async fn acquire_submit(&self, identity: &Identity) -> Decision {
        let LimitSettings {
            message_limit,
            message_window,
            ..
        } = self.settings;
        self.try_acquire(identity, message_limit, message_window, LimitScope::Submit)
            .await
    }

    /// Apply the configured read limit.
    pub async fn acquire_read(&self, identity: &Identity) -> Decision {
        let LimitSettings {
            read_limit,
            read_window,
            ..
        } = self.settings;
        self.try_acquire(identity, read_limit, read_window, LimitScope::Read)
            .await
    }
}
