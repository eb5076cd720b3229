use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use foreman_core::{ContextWindow, Responder, ResponderError, ResponderOutput};

/// Retry behaviour for [`RetryingResponder`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped, ±jitter.
    ///
    /// A server-suggested delay always wins.
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return exp;
        }
        let factor = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
        exp.mul_f64((1.0 + factor).max(0.0))
    }
}

/// Retries transient responder failures with exponential backoff and jitter.
///
/// Only the `respond` call is retried. Once a fragment stream has been
/// handed out the answer is committed: a failure mid-stream reaches the
/// caller as-is and becomes an errored message, never a silent restart that
/// would duplicate text the user already saw.
pub struct RetryingResponder {
    inner: Arc<dyn Responder>,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl RetryingResponder {
    pub fn new(inner: Arc<dyn Responder>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Responder for RetryingResponder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn respond(&self, context: &ContextWindow) -> Result<ResponderOutput, ResponderError> {
        let mut attempt = 0;
        loop {
            match self.inner.respond(context).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.config.delay_for(attempt, e.suggested_delay());
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        responder = self.inner.name(),
                        session_id = %context.session_id,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying responder"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
