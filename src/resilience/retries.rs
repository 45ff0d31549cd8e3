//! Retry policy for cross-boundary calls.
//!
//! # Responsibilities
//! - Bound the number of attempts per call
//! - Space retries with exponential backoff + jitter
//!
//! # Design Decisions
//! - Only timeouts and transport failures are retried; a denied breaker ends the sequence
//! - Jittered backoff prevents thundering herd

use std::time::Duration;

use crate::config::CallConfig;
use crate::resilience::backoff::retry_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before the retry following attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        retry_delay(
            attempt,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl From<&CallConfig> for RetryPolicy {
    fn from(config: &CallConfig) -> Self {
        Self::new(config.max_retries, config.base_delay_ms, config.max_delay_ms)
    }
}
