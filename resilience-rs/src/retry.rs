//! # Retry Policy
//!
//! Backoff schedule used by the retry recovery strategy. Delays are
//! deterministic so that the schedule is monotonic and bounded.

use std::time::Duration;

use ingest_types_rs::ResilienceConfig;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

/// Configuration for a retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first failed call
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Double the delay on every retry instead of keeping it constant
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            exponential: true,
        }
    }
}

impl From<&ResilienceConfig> for RetryConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
            exponential: config.exponential_backoff,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (0 is the first retry).
    ///
    /// `min(base * 2^attempt, max)` with exponential backoff, `min(base, max)`
    /// otherwise.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay;
        let max = self.config.max_delay;

        if !self.config.exponential {
            return base.min(max);
        }

        2u32.checked_pow(attempt)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }

    /// Records the outcome of a finished retry session.
    pub fn record_outcome(&self, source: &str, attempts: u32, succeeded: bool, elapsed: Duration) {
        let outcome = if succeeded { "success" } else { "exhausted" };
        counter!("resilience.retry.sessions", 1, "source" => source.to_string(), "outcome" => outcome);
        histogram!("resilience.retry.attempts", f64::from(attempts), "source" => source.to_string());
        histogram!("resilience.retry.duration_ms", elapsed.as_millis() as f64, "source" => source.to_string());
    }
}
