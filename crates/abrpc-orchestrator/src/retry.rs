use std::time::Duration;

use abrpc_common::protocol::error::AbrpcError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for retry logic with exponential backoff.
///
/// When a call fails with a transient error (transport failure, timeout,
/// 429 or 5xx), the orchestrator retries with exponential backoff up to
/// `max_retries` times. Client-class failures are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Total attempts = max_retries + 1
    /// Default: 3
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    ///
    /// Default: 50ms
    pub base_interval_ms: u64,
    /// Lower bound for any retry delay in milliseconds
    ///
    /// Default: 10ms
    pub min_interval_ms: u64,
    /// Upper bound for any retry delay in milliseconds
    ///
    /// Default: 5000ms (5 seconds)
    pub max_interval_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Each retry waits: previous_delay * multiplier
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
    /// Spread each delay by up to ±10%
    ///
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval_ms: 50,
            min_interval_ms: 10,
            max_interval_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a call that has made `ctx.attempts()` attempts and just
    /// failed with `error` should be tried again.
    pub fn should_retry(&self, error: &AbrpcError, ctx: &RetryContext) -> bool {
        error.is_transient() && ctx.attempts() <= self.max_retries
    }

    /// Delay before retry number `retry` (zero-based).
    ///
    /// `base × multiplier^retry`, clamped to `[min, max]`, then jittered.
    /// A 429 response doubles the base.
    ///
    /// # Example
    ///
    /// ```rust
    /// use abrpc_orchestrator::RetryConfig;
    /// use abrpc_common::protocol::error::AbrpcError;
    /// use std::time::Duration;
    ///
    /// let config = RetryConfig { jitter: false, ..Default::default() };
    /// let unavailable = AbrpcError::Remote { code: 503, message: String::new() };
    /// assert_eq!(config.delay_for(0, &unavailable), Duration::from_millis(50));
    /// assert_eq!(config.delay_for(2, &unavailable), Duration::from_millis(200));
    /// ```
    pub fn delay_for(&self, retry: u32, error: &AbrpcError) -> Duration {
        let mut base = self.base_interval_ms as f64;
        if error.is_too_many_requests() {
            base *= 2.0;
        }

        let min = self.min_interval_ms as f64;
        let max = (self.max_interval_ms as f64).max(min);
        let exponent = retry.min(i32::MAX as u32) as i32;
        let mut delay = (base * self.backoff_multiplier.powi(exponent)).max(min).min(max);

        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.9..=1.1);
        }

        Duration::from_millis(delay.round() as u64)
    }
}

/// Retry bookkeeping for one logical call.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    attempts: u32,
    last_attempt_at: Option<Instant>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt_at = Some(Instant::now());
    }

    /// Attempts made so far, including the initial one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }
}
