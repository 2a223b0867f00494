//! Named job queues over a [`JobStore`].
//!
//! [`QueueStore`] owns every job status transition and emits a
//! [`JobEvent`] on the lifecycle channel for each one. Dequeue long-polls:
//! an empty queue waits on a per-queue [`Notify`] (woken by enqueues) and
//! re-checks every `poll_interval` so delayed retries and writes from other
//! processes are picked up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hireflow_core::error::CoreError;
use hireflow_core::job_events::{
    STAGE_ACTIVE, STAGE_COMPLETED, STAGE_FAILED, STAGE_QUEUED, STAGE_RETRYING,
};
use hireflow_core::payload::JobPayload;
use hireflow_core::retry::{validate_max_attempts, RetryDecision};
use hireflow_core::settings::QueueSettings;
use hireflow_core::types::DbId;
use hireflow_db::models::job::{Job, Lease, NewJob};
use hireflow_db::models::status::JobStatus;
use hireflow_db::store::JobStore;
use hireflow_events::{EventBus, EventKind, JobEvent};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Maximum length of a queue name.
const MAX_QUEUE_NAME_LEN: usize = 64;

/// Maximum length of a caller-supplied correlation id.
const MAX_CORRELATION_ID_LEN: usize = 128;

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Groups events for live subscribers; a UUID v4 is generated when absent.
    pub correlation_id: Option<String>,
    pub max_attempts: Option<i32>,
}

pub struct QueueStore {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    settings: QueueSettings,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>, settings: QueueSettings) -> Self {
        Self {
            store,
            bus,
            settings,
            wakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn waker(&self, queue: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap_or_else(|p| p.into_inner());
        wakers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake slots waiting on `queue` for `jobs` newly runnable jobs.
    pub(crate) fn wake(&self, queue: &str, jobs: usize) {
        let waker = self.waker(queue);
        if jobs > 1 {
            waker.notify_waiters();
        }
        // Leaves a permit if no slot is waiting right now.
        waker.notify_one();
    }

    pub(crate) fn emit(&self, kind: EventKind, stage: &str, job: &Job) -> JobEvent {
        let event = JobEvent::for_job(kind, stage, job);
        self.bus.emit(event.clone());
        event
    }

    /// Resolve per-enqueue options against the queue defaults.
    pub(crate) fn resolve(&self, options: EnqueueOptions) -> Result<(String, i32), CoreError> {
        let max_attempts = options.max_attempts.unwrap_or(self.settings.max_attempts);
        validate_max_attempts(max_attempts)?;
        let correlation_id = match options.correlation_id {
            Some(id) => {
                validate_correlation_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        Ok((correlation_id, max_attempts))
    }

    // -- producer side -----------------------------------------------------

    /// Add a pending job to `queue`.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Job, CoreError> {
        validate_queue_name(queue)?;
        let (correlation_id, max_attempts) = self.resolve(options)?;

        let job = self
            .store
            .insert(NewJob {
                queue_name: queue.to_string(),
                payload,
                correlation_id,
                max_attempts,
            })
            .await?;

        tracing::info!(
            job_id = job.id,
            queue = %job.queue_name,
            kind = %job.kind,
            correlation_id = %job.correlation_id,
            "Job enqueued",
        );
        self.emit(EventKind::Progress, STAGE_QUEUED, &job);
        self.wake(queue, 1);
        Ok(job)
    }

    pub async fn get(&self, job_id: DbId) -> Result<Option<Job>, CoreError> {
        Ok(self.store.find_by_id(job_id).await?)
    }

    // -- consumer side -----------------------------------------------------

    /// Lease the next job, waiting up to the configured dequeue timeout.
    pub async fn dequeue(&self, queue: &str) -> Result<Option<Job>, CoreError> {
        self.dequeue_timeout(queue, self.settings.dequeue_timeout).await
    }

    /// Lease the next job, waiting up to `timeout` for one to become runnable.
    pub async fn dequeue_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, CoreError> {
        let deadline = Instant::now() + timeout;
        let waker = self.waker(queue);

        loop {
            self.reap(queue).await?;

            // Register interest before checking, so an enqueue between the
            // check and the wait is not missed.
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self
                .store
                .claim_next(queue, self.settings.lease_duration)
                .await?
            {
                tracing::debug!(
                    job_id = job.id,
                    queue,
                    attempt = job.attempts,
                    "Job leased",
                );
                self.emit(EventKind::Progress, STAGE_ACTIVE, &job);
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.settings.poll_interval);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Release expired leases in `queue` and report the transitions.
    async fn reap(&self, queue: &str) -> Result<(), CoreError> {
        for job in self.store.reap_expired(queue).await? {
            if job.status == JobStatus::Failed {
                tracing::warn!(
                    job_id = job.id,
                    queue,
                    attempts = job.attempts,
                    "Lease expired with no attempts left, job failed",
                );
                let message = job.error.clone().unwrap_or_default();
                self.bus.emit(
                    JobEvent::for_job(EventKind::Failed, STAGE_FAILED, &job).with_message(message),
                );
            } else {
                tracing::warn!(job_id = job.id, queue, "Lease expired, job re-queued");
                let message = job.error.clone().unwrap_or_default();
                self.bus.emit(
                    JobEvent::for_job(EventKind::Progress, STAGE_RETRYING, &job)
                        .with_message(message),
                );
            }
        }
        Ok(())
    }

    /// Record handler progress; also extends the lease.
    pub async fn report_progress(
        &self,
        lease: &Lease,
        stage: &str,
        percent: u8,
        message: Option<&str>,
    ) -> Result<Job, CoreError> {
        let job = self
            .store
            .update_progress(
                lease,
                i16::from(percent.min(100)),
                message.or(Some(stage)),
                self.settings.lease_duration,
            )
            .await?;
        self.emit(EventKind::Progress, stage, &job);
        Ok(job)
    }

    /// Complete a leased job with its result.
    pub async fn ack(&self, lease: &Lease, result: serde_json::Value) -> Result<Job, CoreError> {
        let job = self.store.complete(lease, &result).await?;
        tracing::info!(
            job_id = job.id,
            queue = %job.queue_name,
            attempts = job.attempts,
            "Job completed",
        );
        self.bus
            .emit(JobEvent::for_job(EventKind::Completed, STAGE_COMPLETED, &job).with_data(result));
        Ok(job)
    }

    /// Record a failed execution of a leased job.
    ///
    /// The job returns to `pending` after the backoff delay while attempts
    /// remain, unless `permanent` is set; otherwise it becomes `failed`.
    pub async fn fail(&self, lease: &Lease, error: &str, permanent: bool) -> Result<Job, CoreError> {
        let current = self
            .store
            .find_by_id(lease.job_id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "Job",
                id: lease.job_id,
            })?;

        match self
            .settings
            .retry
            .decide(current.attempts, current.max_attempts, permanent)
        {
            RetryDecision::Retry { delay } => {
                let job = self.store.retry_later(lease, error, delay).await?;
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error,
                    "Job failed, retry scheduled",
                );
                self.bus.emit(
                    JobEvent::for_job(EventKind::Progress, STAGE_RETRYING, &job)
                        .with_message(error)
                        .with_data(serde_json::json!({
                            "attempts": job.attempts,
                            "max_attempts": job.max_attempts,
                            "retry_in_ms": delay.as_millis() as u64,
                        })),
                );
                Ok(job)
            }
            RetryDecision::GiveUp => {
                let job = self.store.fail(lease, error).await?;
                tracing::warn!(
                    job_id = job.id,
                    attempts = job.attempts,
                    permanent,
                    error,
                    "Job failed permanently",
                );
                self.bus.emit(
                    JobEvent::for_job(EventKind::Failed, STAGE_FAILED, &job).with_message(error),
                );
                Ok(job)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Queue names are 1-64 characters of `[A-Za-z0-9_.-]`.
pub fn validate_queue_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation("Queue name must not be empty".into()));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Queue name must not exceed {MAX_QUEUE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(CoreError::Validation(format!(
            "Queue name '{name}' may only contain letters, digits, '-', '_' or '.'"
        )));
    }
    Ok(())
}

/// Correlation ids are 1-128 characters and not blank.
pub fn validate_correlation_id(id: &str) -> Result<(), CoreError> {
    if id.trim().is_empty() || id.len() > MAX_CORRELATION_ID_LEN {
        return Err(CoreError::Validation(format!(
            "correlation_id must be 1-{MAX_CORRELATION_ID_LEN} non-blank characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert!(validate_queue_name("resumes").is_ok());
        assert!(validate_queue_name("scoring.v2-fast_lane").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name(&"q".repeat(65)).is_err());
    }

    #[test]
    fn correlation_ids() {
        assert!(validate_correlation_id("batch-42").is_ok());
        assert!(validate_correlation_id("   ").is_err());
        assert!(validate_correlation_id(&"c".repeat(129)).is_err());
    }
}
