//! Counter stores: where per-identity sliding logs live.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors raised by a counter store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CounterStoreError {
    /// The backend could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic admit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The action was recorded.
    Admitted,
    /// The window is full. Nothing was recorded.
    Rejected {
        /// Time until the oldest entry leaves the window.
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the action was admitted.
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// The fast shared counter store.
///
/// `admit` must be atomic per key: evict timestamps strictly older than
/// `now - window`, then record `now` only if fewer than `limit` remain.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn admit(
        &self,
        key: &str,
        now: Instant,
        window: Duration,
        limit: u32,
    ) -> Result<Admission, CounterStoreError>;
}

const BOUNDARY_STEP: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct SlidingLog {
    hits: VecDeque<Instant>,
    expires_at: Instant,
}

impl SlidingLog {
    fn evict(&mut self, now: Instant, window: Duration) {
        while self.hits.front().is_some_and(|&t| t + window < now) {
            let _ = self.hits.pop_front();
        }
    }
}

/// In-process counter store.
///
/// Each key's log expires `window` after its last admitted action, so idle
/// identities are reclaimed by [`MemoryCounterStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    logs: DashMap<String, SlidingLog>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.logs.len()
    }

    /// Drop every log whose lifetime has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.logs.len();
        self.logs.retain(|_, log| log.expires_at >= now);
        before.saturating_sub(self.logs.len())
    }

    /// Periodically purge expired logs until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(purged, remaining = store.tracked(), "purged idle rate windows");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(
        &self,
        key: &str,
        now: Instant,
        window: Duration,
        limit: u32,
    ) -> Result<Admission, CounterStoreError> {
        // The entry guard holds the shard lock, which makes evict+check+record atomic per key.
        let mut log = self.logs.entry(key.to_owned()).or_insert_with(|| SlidingLog {
            hits: VecDeque::new(),
            expires_at: now + window,
        });
        log.evict(now, window);

        if log.hits.len() < limit as usize {
            log.hits.push_back(now);
            log.expires_at = now + window;
            return Ok(Admission::Admitted);
        }

        // A hit exactly `window` old still counts, so the slot frees just after.
        let retry_after = log.hits.front().map_or(window, |&oldest| {
            (oldest + window + BOUNDARY_STEP).saturating_duration_since(now)
        });
        Ok(Admission::Rejected { retry_after })
    }
}
