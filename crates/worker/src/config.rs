use std::time::Duration;

use hireflow_core::error::CoreError;
use hireflow_core::retry::{
    validate_max_attempts, RetryPolicy, DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_ATTEMPTS,
};
use hireflow_core::settings::{
    QueueSettings, RetentionPolicy, DEFAULT_CONCURRENCY, DEFAULT_DEQUEUE_POLL_MS,
    DEFAULT_DEQUEUE_TIMEOUT_MS, DEFAULT_LEASE_SECS, DEFAULT_RETAIN_COMPLETED,
    DEFAULT_RETAIN_FAILED,
};

use crate::queue::validate_queue_name;

/// Default `WORKER_QUEUES` value.
const DEFAULT_QUEUES: &str = "resumes:4,scoring:4";

/// Default retention sweep interval in seconds.
const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 60;

/// Maximum slots per queue.
const MAX_CONCURRENCY: usize = 256;

/// A queue to consume and how many slots to give it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub concurrency: usize,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<QueueSpec>,
    pub settings: QueueSettings,
    pub retention: RetentionPolicy,
    pub retention_interval: Duration,
    /// Base URL of the AI worker service; jobs are only delegated when set.
    pub ai_worker_url: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default               |
    /// |---------------------------|-----------------------|
    /// | `WORKER_QUEUES`           | `resumes:4,scoring:4` |
    /// | `JOB_MAX_ATTEMPTS`        | `3`                   |
    /// | `JOB_BACKOFF_BASE_MS`     | `2000`                |
    /// | `JOB_LEASE_SECS`          | `300`                 |
    /// | `DEQUEUE_TIMEOUT_MS`      | `5000`                |
    /// | `DEQUEUE_POLL_MS`         | `250`                 |
    /// | `RETAIN_COMPLETED_JOBS`   | `1000`                |
    /// | `RETAIN_FAILED_JOBS`      | `5000`                |
    /// | `RETENTION_INTERVAL_SECS` | `60`                  |
    /// | `AI_WORKER_URL`           | unset                 |
    pub fn from_env() -> Self {
        let queues = parse_queues(
            &std::env::var("WORKER_QUEUES").unwrap_or_else(|_| DEFAULT_QUEUES.into()),
        )
        .expect("WORKER_QUEUES must be a list of name:concurrency pairs");

        let max_attempts: i32 = env_or("JOB_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS);
        validate_max_attempts(max_attempts).expect("JOB_MAX_ATTEMPTS out of range");

        let backoff_base_ms: u64 = env_or("JOB_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS);
        let lease_secs: u64 = env_or("JOB_LEASE_SECS", DEFAULT_LEASE_SECS);
        let dequeue_timeout_ms: u64 = env_or("DEQUEUE_TIMEOUT_MS", DEFAULT_DEQUEUE_TIMEOUT_MS);
        let poll_ms: u64 = env_or("DEQUEUE_POLL_MS", DEFAULT_DEQUEUE_POLL_MS);

        let retention = RetentionPolicy {
            keep_completed: env_or("RETAIN_COMPLETED_JOBS", DEFAULT_RETAIN_COMPLETED),
            keep_failed: env_or("RETAIN_FAILED_JOBS", DEFAULT_RETAIN_FAILED),
        };
        let retention_interval_secs: u64 =
            env_or("RETENTION_INTERVAL_SECS", DEFAULT_RETENTION_INTERVAL_SECS);

        let ai_worker_url = std::env::var("AI_WORKER_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            queues,
            settings: QueueSettings {
                max_attempts,
                retry: RetryPolicy::new(Duration::from_millis(backoff_base_ms)),
                lease_duration: Duration::from_secs(lease_secs.max(1)),
                dequeue_timeout: Duration::from_millis(dequeue_timeout_ms),
                poll_interval: Duration::from_millis(poll_ms.max(1)),
            },
            retention,
            retention_interval: Duration::from_secs(retention_interval_secs.max(1)),
            ai_worker_url,
        }
    }
}

/// Parse an env var, falling back to `default` when unset.
///
/// Panics on a malformed value so misconfiguration fails at start-up.
pub fn env_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}

/// Parse `name:concurrency,name:concurrency,...`.
///
/// A bare `name` gets the default concurrency.
pub fn parse_queues(spec: &str) -> Result<Vec<QueueSpec>, CoreError> {
    let mut queues: Vec<QueueSpec> = Vec::new();

    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, concurrency) = match entry.split_once(':') {
            Some((name, n)) => {
                let n: usize = n.trim().parse().map_err(|_| {
                    CoreError::Validation(format!("Invalid concurrency in '{entry}'"))
                })?;
                (name.trim(), n)
            }
            None => (entry, DEFAULT_CONCURRENCY),
        };
        validate_queue_name(name)?;
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(CoreError::Validation(format!(
                "Concurrency for '{name}' must be between 1 and {MAX_CONCURRENCY}"
            )));
        }
        if queues.iter().any(|q| q.name == name) {
            return Err(CoreError::Validation(format!("Queue '{name}' listed twice")));
        }
        queues.push(QueueSpec {
            name: name.to_string(),
            concurrency,
        });
    }

    if queues.is_empty() {
        return Err(CoreError::Validation("At least one queue is required".into()));
    }
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_spec() {
        let queues = parse_queues(DEFAULT_QUEUES).unwrap();
        assert_eq!(
            queues,
            vec![
                QueueSpec {
                    name: "resumes".into(),
                    concurrency: 4
                },
                QueueSpec {
                    name: "scoring".into(),
                    concurrency: 4
                },
            ]
        );
    }

    #[test]
    fn bare_name_gets_default_concurrency() {
        let queues = parse_queues(" ranking , resumes:2").unwrap();
        assert_eq!(queues[0].concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(queues[1].concurrency, 2);
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(parse_queues("").is_err());
        assert!(parse_queues("resumes:zero").is_err());
        assert!(parse_queues("resumes:0").is_err());
        assert!(parse_queues("resumes:1,resumes:2").is_err());
        assert!(parse_queues("bad name:1").is_err());
    }
}
