//! Retry policy for failed job executions.
//!
//! Pure functions only; the queue store applies the decision.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Attempts a job gets when the caller does not specify `max_attempts`.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Backoff base; the delay is this times `2^attempts`.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound on the exponent so the shift never overflows.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Upper bound on a caller-supplied `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: i32 = 25;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
}

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending`, runnable after `delay`.
    Retry { delay: Duration },
    /// Mark the job terminally `failed`.
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff_base: Duration) -> Self {
        Self { backoff_base }
    }

    /// Delay before the next run, given the number of attempts already made.
    ///
    /// `base * 2^attempts`: 4s after the first failure, then 8s, 16s, ...
    /// with the default base.
    pub fn backoff_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.max(0) as u32;
        let factor = 1u32 << exponent.min(MAX_BACKOFF_EXPONENT);
        self.backoff_base.saturating_mul(factor)
    }

    /// Decide the fate of a failed execution.
    ///
    /// `attempts` counts the execution that just failed. A `permanent` error
    /// skips any remaining attempts.
    pub fn decide(&self, attempts: i32, max_attempts: i32, permanent: bool) -> RetryDecision {
        if permanent || attempts >= max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.backoff_delay(attempts),
            }
        }
    }
}

/// Check a caller-supplied `max_attempts`.
pub fn validate_max_attempts(max_attempts: i32) -> Result<(), crate::error::CoreError> {
    if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
        return Err(crate::error::CoreError::Validation(format!(
            "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {max_attempts}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
