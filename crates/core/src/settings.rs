//! Tunables shared by the queue store, worker pool, and retention task.

use std::time::Duration;

use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Default lease length; a job not acked within this window is re-dequeued.
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// Default long-poll window for an empty `dequeue`.
pub const DEFAULT_DEQUEUE_TIMEOUT_MS: u64 = 5_000;

/// Default re-check interval while long-polling (catches delayed retries
/// becoming due and writes from other processes).
pub const DEFAULT_DEQUEUE_POLL_MS: u64 = 250;

/// Default per-queue worker concurrency.
pub const DEFAULT_CONCURRENCY: usize = 4;

pub const DEFAULT_RETAIN_COMPLETED: usize = 1_000;
pub const DEFAULT_RETAIN_FAILED: usize = 5_000;

/// How many finished root jobs to keep, by outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: DEFAULT_RETAIN_COMPLETED,
            keep_failed: DEFAULT_RETAIN_FAILED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: i32,
    pub retry: RetryPolicy,
    pub lease_duration: Duration,
    pub dequeue_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::default(),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
            dequeue_timeout: Duration::from_millis(DEFAULT_DEQUEUE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_DEQUEUE_POLL_MS),
        }
    }
}
