use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Error type for retry policy configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryPolicyError {
    #[error("max_attempts must be > 0")]
    ZeroAttempts,

    #[error("base_delay must be > 0")]
    ZeroBaseDelay,
}

/// Exponents beyond this would overflow the shift; delays are capped by
/// `max_delay` long before it matters.
const MAX_EXPONENT: u32 = 16;

/// A bounded retry policy: a fixed attempt ceiling with deterministic
/// exponential backoff between attempts.
///
/// The wrapped action always runs at least once. The delay before retry
/// `n` (1-based) is `base_delay * 2^(n-1)`, capped at `max_delay`.
/// [`delay_for`](Self::delay_for) is fully deterministic given the
/// configuration; [`delay_with_jitter`](Self::delay_with_jitter) adds a
/// bounded random component for cross-process spread, which is what the
/// outbox dispatcher stores into `next_retry_time`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if self.base_delay.is_zero() {
            return Err(RetryPolicyError::ZeroBaseDelay);
        }
        Ok(())
    }

    /// Deterministic delay before retry `attempt` (1-based: the delay
    /// after the first failed attempt is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms.min(cap_ms))
    }

    /// [`delay_for`](Self::delay_for) plus a random component in
    /// `0..=jitter`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.delay_for(attempt);
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.delay_for(attempt) + Duration::from_millis(jitter)
    }
}
