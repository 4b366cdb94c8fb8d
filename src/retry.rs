//! Exponential backoff with jitter, shared by the LLM transport adapter's
//! retry wrapper and the MCP client's auto-reconnect. The default curve
//! (3 attempts, 30s cap) is exactly the reconnect policy `spec.md` §4.3
//! calls for, so both components share this one config type.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: usize,
    /// Initial delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Maximum delay between retries (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }

    /// Delay for a given attempt (1-indexed), exponential backoff with
    /// +/-20% jitter, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped_ms = base_ms.min(self.max_delay_ms as f64);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((capped_ms * jitter) as u64)
    }
}

pub(crate) fn log_retry(attempt: usize, max: usize, delay: &Duration, error: &dyn std::fmt::Display) {
    warn!(
        "transient error (attempt {}/{}), retrying in {:.1}s: {}",
        attempt,
        max,
        delay.as_secs_f64(),
        error
    );
}
