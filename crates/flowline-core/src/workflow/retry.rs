//! Bounded retry with exponential backoff.
//!
//! Stateless: the step runner owns the attempt counter and asks the policy
//! whether another attempt is allowed and how long to wait before it.

use std::time::Duration;

use flowline_types::run::ErrorKind;
use flowline_types::workflow::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff_ms: u64,
    backoff_multiplier: f64,
    max_backoff_ms: u64,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Policy for a step: its `retry:` block, or a single attempt.
    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        match config {
            Some(c) => Self {
                max_attempts: c.max_attempts.max(1),
                initial_backoff_ms: c.initial_backoff_ms,
                backoff_multiplier: c.backoff_multiplier.max(1.0),
                max_backoff_ms: c.max_backoff_ms,
            },
            None => Self::none(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether attempt `attempt + 1` may run after attempt `attempt`
    /// (1-based) failed with `kind`.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        attempt < self.max_attempts && kind.is_retryable()
    }

    /// Delay after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(Some(&RetryConfig::default()))
    }
}
