//! Bounded retry with jittered exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Retry discipline for idempotent Provider requests.
///
/// Retries apply to connection errors, HTTP 5xx, and HTTP 429; the delay
/// grows exponentially from `base_delay` to `max_delay` with jitter, and a
/// server-advertised `Retry-After` takes precedence on 429.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Whether `attempt` (1-based) was the last allowed attempt.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Jittered delay before the retry that follows `attempt` (1-based).
    ///
    /// The exponential ceiling for attempt N is `base × 2^(N-1)`, clamped
    /// to `max_delay`; the returned delay is drawn from the upper half of
    /// that ceiling so retries never exceed the exponential schedule.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << exp)
            .min(self.max_delay.as_millis()) as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let floor_ms = ceiling_ms / 2;
        let jittered = rand::thread_rng().gen_range(floor_ms..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}
