//! Capped exponential backoff.
//!
//! Used for chain source calls (retried forever), order store commits
//! (retried a bounded number of times) and indexer restarts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first try; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry (milliseconds).
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Same backoff curve, bounded to `max_retries` attempts.
    pub fn bounded(&self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self.clone()
        }
    }
}

/// Stateless retry policy. Computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), or `None`
    /// once the retry budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped.max(0.0) as u64))
    }

    /// Returns `true` if a retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.config.max_retries.map_or(true, |max| attempt <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
