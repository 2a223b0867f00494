//! Worker pool.
//!
//! Each started queue gets `concurrency` slots. A slot loops: dequeue, run
//! the handler registered for `(queue, kind)`, then ack or fail. Handlers run
//! in their own task so a panic is caught and recorded as a retryable
//! failure instead of taking the slot down.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hireflow_core::error::CoreError;
use hireflow_core::payload::{JobKind, JobPayload};
use hireflow_db::models::job::{Job, Lease};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::QueueStore;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Why a handler could not finish a job.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt (timeouts, upstream 5xx).
    #[error("{0}")]
    Retryable(String),

    /// Will fail the same way every time; remaining attempts are skipped.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl fmt::Display) -> Self {
        Self::Retryable(message.to_string())
    }

    pub fn permanent(message: impl fmt::Display) -> Self {
        Self::Permanent(message.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Permanent(msg),
            other => Self::Retryable(other.to_string()),
        }
    }
}

/// Everything a handler gets for one execution.
pub struct JobContext {
    pub job: Job,
    pub payload: JobPayload,
    queue: Arc<QueueStore>,
    lease: Lease,
}

impl JobContext {
    /// `(child_index, child_total)` when the job is part of a flow.
    pub fn position(&self) -> Option<(i32, i32)> {
        self.job.child_index.zip(self.job.child_total)
    }

    /// Report a step. Extends the lease; fails with `Conflict` if the lease
    /// has been lost.
    pub async fn report(
        &self,
        stage: &str,
        percent: u8,
        message: Option<&str>,
    ) -> Result<(), CoreError> {
        self.queue
            .report_progress(&self.lease, stage, percent, message)
            .await
            .map(|_| ())
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, HandlerError> {
        (self.0)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

type HandlerKey = (String, JobKind);

pub struct WorkerPool {
    queue: Arc<QueueStore>,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn JobHandler>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self {
            queue,
            handlers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Register (or replace) the handler for `kind` jobs on `queue`.
    pub async fn register_handler(&self, queue: &str, kind: JobKind, handler: Arc<dyn JobHandler>) {
        tracing::info!(queue, kind = %kind, "Job handler registered");
        self.handlers
            .write()
            .await
            .insert((queue.to_string(), kind), handler);
    }

    /// Spawn `concurrency` slots consuming `queue`.
    pub fn start(self: &Arc<Self>, queue: &str, concurrency: usize) {
        tracing::info!(queue, concurrency, "Worker slots starting");
        for slot in 0..concurrency.max(1) {
            let pool = Arc::clone(self);
            let queue = queue.to_string();
            self.tracker.spawn(async move { pool.run_slot(queue, slot).await });
        }
    }

    /// Stop dequeuing and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Worker pool stopped");
    }

    /// Number of running slots.
    pub fn slot_count(&self) -> usize {
        self.tracker.len()
    }

    async fn run_slot(self: Arc<Self>, queue: String, slot: usize) {
        tracing::debug!(queue = %queue, slot, "Worker slot started");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.queue.dequeue(&queue) => next,
            };

            match next {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(queue = %queue, slot, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.queue.settings().poll_interval) => {}
                    }
                }
            }
        }

        tracing::debug!(queue = %queue, slot, "Worker slot stopped");
    }

    async fn execute(&self, job: Job) {
        let Some(lease) = job.lease() else {
            tracing::error!(job_id = job.id, "Dequeued job carries no lease");
            return;
        };

        let payload = match JobPayload::from_parts(job.kind.as_str(), job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                self.settle_failure(&lease, &e.to_string(), true).await;
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .await
            .get(&(job.queue_name.clone(), job.kind))
            .cloned();
        let Some(handler) = handler else {
            let error = format!(
                "No handler registered for kind '{}' on queue '{}'",
                job.kind, job.queue_name
            );
            self.settle_failure(&lease, &error, true).await;
            return;
        };

        let job_id = job.id;
        let ctx = JobContext {
            job,
            payload,
            queue: Arc::clone(&self.queue),
            lease,
        };

        match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(Ok(result)) => match self.queue.ack(&lease, result).await {
                Ok(_) => {}
                Err(CoreError::Conflict(msg)) => {
                    tracing::warn!(job_id, error = %msg, "Result discarded, lease lost");
                }
                Err(e) => tracing::error!(job_id, error = %e, "Failed to ack job"),
            },
            Ok(Err(e)) => {
                self.settle_failure(&lease, &e.to_string(), e.is_permanent())
                    .await;
            }
            Err(join_err) => {
                let error = if join_err.is_panic() {
                    format!("Handler panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "Handler task was cancelled".to_string()
                };
                tracing::error!(job_id, error = %error, "Handler crashed");
                self.settle_failure(&lease, &error, false).await;
            }
        }
    }

    async fn settle_failure(&self, lease: &Lease, error: &str, permanent: bool) {
        match self.queue.fail(lease, error, permanent).await {
            Ok(_) => {}
            Err(CoreError::Conflict(msg)) => {
                tracing::warn!(job_id = lease.job_id, error = %msg, "Failure discarded, lease lost");
            }
            Err(e) => {
                tracing::error!(job_id = lease.job_id, error = %e, "Failed to record job failure");
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
