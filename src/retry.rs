//! Retry and reconnect policies.
//!
//! Two call sites retry in this crate and they want different shapes:
//! the stream manager runs a bounded exponential backoff before declaring
//! its token invalid, while the session recovery path retries login on a
//! fixed interval forever.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Policy controlling stream reconnect attempts and backoff growth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed reconnect attempts tolerated before the token is
    /// declared invalid. Counts reconnects only, not the connection that
    /// ended: `0` invalidates on the first termination (what a one-based
    /// "max attempts = 1" strategy calls immediate), and `1` allows one
    /// reconnect.
    pub max_attempts: usize,
    /// Delay applied after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for exponential delay growth.
    pub max_delay: Duration,
    /// Pause between observing the end of a stream and the first reconnect
    /// attempt.
    pub settle_delay: Duration,
}

impl ReconnectPolicy {
    /// Reconnects with doubling delays (1s, 2s, 4s, ... capped at 60s) and
    /// gives up after five consecutive failures.
    pub fn bounded_backoff() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            settle_delay: Duration::from_secs(3),
        }
    }

    /// Treats any stream termination as proof of an invalid token.
    pub fn invalidate_on_disconnect() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
        }
    }

    /// Returns `true` when terminations go straight to invalidation.
    pub fn is_immediate(&self) -> bool {
        self.max_attempts == 0
    }

    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based. `delay_for_attempt(1)` is always `base_delay`
    /// (clamped to `max_delay`).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = std::cmp::min(self.base_delay, self.max_delay);
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_delay);
        }
        delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::bounded_backoff()
    }
}

/// Progress through one reconnect sequence.
///
/// Scoped to a single sequence; a successful connect discards it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: usize,
    pub last_delay: Duration,
}

impl RetryState {
    /// Records a failed attempt and returns the delay to wait before the next
    /// one, or `None` once the policy's budget is spent.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= policy.max_attempts {
            return None;
        }
        self.last_delay = policy.delay_for_attempt(self.attempt);
        Some(self.last_delay)
    }
}

/// Runs `op` until it succeeds, sleeping `interval` between attempts.
///
/// `op` receives the 1-based attempt number. Failures are logged and never
/// returned.
pub async fn retry_forever<T, E, Op, Fut>(interval: Duration, mut op: Op) -> T
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return value,
            Err(error) => {
                warn!(
                    event = "retry_attempt_failed",
                    attempt,
                    delay_ms = interval.as_millis() as u64,
                    error = %error
                );
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}
