//! Bounded exponential backoff for transient remote failures.
//!
//! ```text
//! delay = initial_interval * backoff_factor ^ attempt
//! delay = min(delay, max_interval)
//! if jitter: delay *= random(0.5..=1.5)
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often and how patiently a failed remote call is retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry, in seconds.
    pub initial_interval: f64,
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_interval: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: 0.05,
            backoff_factor: 2.0,
            max_interval: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds.max(0.0);
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds.max(0.0);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_interval * self.backoff_factor.powi(exp);
        let mut delay = base.min(self.max_interval);
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.5..=1.5);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Whether attempt number `attempt` (0-based) may still be made.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Attempts made so far on one operation.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        self.last_error = error;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}
