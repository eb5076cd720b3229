use std::time::Duration;

use rand::Rng;

/// Exponential reconnect delays: `base * 2^attempt`, capped at `max`, with
/// ±`jitter` applied so many clients dropped together do not reconnect in
/// lockstep.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.2,
            attempt: 0,
        }
    }

    /// Disable or change jitter (0.0 gives exact delays).
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2_u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= 0.0 {
            return exp;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        exp.mul_f64(1.0 + factor).min(self.max)
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
