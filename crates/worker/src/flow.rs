//! Flow coordination.
//!
//! A flow is a parent job plus its ordered children. The parent is never
//! executed; it completes when every child is terminal, whatever their
//! outcomes. The coordinator is also the single consumer that turns
//! lifecycle events into correlation-topic updates for live subscribers:
//!
//! - standalone job events pass through unchanged;
//! - child progress becomes a flow progress update carrying the child's
//!   position;
//! - a child reaching a terminal state triggers a recomputation of the
//!   flow aggregate from a fresh snapshot of all children.
//!
//! When the lifecycle stream lags, or a subscriber arrives after the bus
//! forgot its correlation, terminal events are rebuilt from the store.
//!
//! Recomputation for one parent is serialized by a per-parent mutex, and
//! the parent's transition is a compare-and-set in the store, so the
//! completion event is published exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hireflow_core::error::CoreError;
use hireflow_core::flow::{validate_child_count, FlowCounts, FlowStatus};
use hireflow_core::job_events::{
    STAGE_CHILD_COMPLETED, STAGE_CHILD_FAILED, STAGE_COMPLETED, STAGE_FAILED,
    STAGE_FLOW_COMPLETED, STAGE_QUEUED,
};
use hireflow_core::payload::JobPayload;
use hireflow_core::types::DbId;
use hireflow_db::models::job::{Job, NewFlow};
use hireflow_db::models::status::JobStatus;
use hireflow_events::{EventBus, EventKind, JobEvent, ProgressUpdate};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::queue::{validate_queue_name, EnqueueOptions, QueueStore};

/// Result of [`FlowCoordinator::create_flow`].
#[derive(Debug, Clone)]
pub struct CreatedFlow {
    pub parent: Job,
    pub children: Vec<Job>,
}

/// Aggregate view of a flow, computed from its children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSummary {
    pub parent_id: DbId,
    pub correlation_id: String,
    pub status: FlowStatus,
    pub total: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub percent: u8,
}

impl FlowSummary {
    fn new(parent: &Job, counts: FlowCounts) -> Self {
        Self {
            parent_id: parent.id,
            correlation_id: parent.correlation_id.clone(),
            status: counts.status(),
            total: counts.total,
            completed_count: counts.completed_count,
            failed_count: counts.failed_count,
            percent: counts.percent(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            FlowStatus::Complete | FlowStatus::CompleteWithFailures
        )
    }

    fn breakdown(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "total": self.total,
            "completed_count": self.completed_count,
            "failed_count": self.failed_count,
        })
    }
}

pub struct FlowCoordinator {
    queue: Arc<QueueStore>,
    locks: Mutex<HashMap<DbId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlowCoordinator {
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self {
            queue,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.queue.bus()
    }

    fn flow_lock(&self, parent_id: DbId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(parent_id).or_default().clone()
    }

    fn release_lock(&self, parent_id: DbId) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.remove(&parent_id);
    }

    // -- creation ----------------------------------------------------------

    /// Create a parent job and its children in one atomic store operation.
    ///
    /// Children run on `queue` in any order; each carries its 1-based index
    /// and the total. Nothing is persisted if any payload is rejected.
    pub async fn create_flow(
        &self,
        queue: &str,
        parent: JobPayload,
        children: Vec<JobPayload>,
        options: EnqueueOptions,
    ) -> Result<CreatedFlow, CoreError> {
        validate_queue_name(queue)?;
        validate_child_count(children.len())?;
        let (correlation_id, max_attempts) = self.queue.resolve(options)?;

        let (parent, children) = self
            .queue
            .store()
            .insert_flow(NewFlow {
                queue_name: queue.to_string(),
                correlation_id,
                max_attempts,
                parent,
                children,
            })
            .await?;

        tracing::info!(
            parent_id = parent.id,
            queue,
            children = children.len(),
            correlation_id = %parent.correlation_id,
            "Flow created",
        );

        self.queue.bus().publish(
            &parent.correlation_id,
            ProgressUpdate::new(EventKind::Progress, STAGE_QUEUED)
                .job(parent.id)
                .percent(0)
                .data(serde_json::json!({ "total": children.len() })),
        );
        self.queue.wake(queue, children.len());

        Ok(CreatedFlow { parent, children })
    }

    // -- queries -----------------------------------------------------------

    /// Current aggregate state of the flow rooted at `parent_id`.
    pub async fn flow_summary(&self, parent_id: DbId) -> Result<FlowSummary, CoreError> {
        let store = self.queue.store();
        let parent = store
            .find_by_id(parent_id)
            .await?
            .filter(|job| job.is_flow_parent)
            .ok_or(CoreError::NotFound {
                entity: "Flow",
                id: parent_id,
            })?;
        let children = store.list_children(parent_id).await?;
        let counts = FlowCounts::tally(children.iter().map(Job::child_outcome));
        Ok(FlowSummary::new(&parent, counts))
    }

    // -- aggregation -------------------------------------------------------

    /// Recompute the aggregate of one flow after a child became terminal.
    ///
    /// Publishes a flow progress update for `trigger` and, once every child
    /// is terminal, completes the parent and publishes the final event.
    /// Returns `None` if the flow had already completed.
    pub async fn recompute_flow(
        &self,
        parent_id: DbId,
        trigger: Option<&JobEvent>,
    ) -> Result<Option<FlowSummary>, CoreError> {
        let lock = self.flow_lock(parent_id);
        let _guard = lock.lock().await;

        let store = self.queue.store();
        let Some(parent) = store.find_by_id(parent_id).await? else {
            self.release_lock(parent_id);
            return Err(CoreError::NotFound {
                entity: "Flow",
                id: parent_id,
            });
        };
        if parent.status == JobStatus::Completed {
            self.release_lock(parent_id);
            return Ok(None);
        }

        let children = store.list_children(parent_id).await?;
        let counts = FlowCounts::tally(children.iter().map(Job::child_outcome));
        let summary = FlowSummary::new(&parent, counts);
        let bus = self.queue.bus();

        if let Some(event) = trigger {
            let stage = if event.kind == EventKind::Failed {
                STAGE_CHILD_FAILED
            } else {
                STAGE_CHILD_COMPLETED
            };
            bus.publish(
                &parent.correlation_id,
                ProgressUpdate::new(EventKind::Progress, stage)
                    .job(event.job_id)
                    .percent(summary.percent)
                    .message(event.message.clone())
                    .data(serde_json::json!({
                        "child_index": event.child_index,
                        "child_total": event.child_total,
                        "total": summary.total,
                        "completed_count": summary.completed_count,
                        "failed_count": summary.failed_count,
                    })),
            );
        }

        if counts.is_complete() {
            let breakdown = summary.breakdown();
            if store
                .complete_flow_parent(parent_id, &breakdown)
                .await?
                .is_some()
            {
                tracing::info!(
                    parent_id,
                    status = ?summary.status,
                    completed = summary.completed_count,
                    failed = summary.failed_count,
                    "Flow completed",
                );
                bus.publish(
                    &parent.correlation_id,
                    ProgressUpdate::new(EventKind::Completed, STAGE_FLOW_COMPLETED)
                        .job(parent_id)
                        .percent(100)
                        .data(breakdown),
                );
            }
            self.release_lock(parent_id);
        }

        Ok(Some(summary))
    }

    /// Recompute every open flow; used at start-up and after the lifecycle
    /// stream lagged.
    pub async fn sweep(&self) -> Result<usize, CoreError> {
        let open = self.queue.store().list_open_flow_parents().await?;
        let mut completed = 0;
        for parent in &open {
            match self.recompute_flow(parent.id, None).await {
                Ok(Some(summary)) if summary.is_finished() => completed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(parent_id = parent.id, error = %e, "Flow recompute failed");
                }
            }
        }
        tracing::info!(open = open.len(), completed, "Flow sweep finished");
        Ok(completed)
    }

    // -- reconciliation ----------------------------------------------------

    /// Publish the terminal event of `correlation_id` from persisted state,
    /// if its newest root job has ended.
    ///
    /// An open flow whose children are all terminal is completed here. The
    /// bus drops the publish if the terminal event already went out, so
    /// calling this for a correlation the relay is handling is harmless.
    /// Returns whether the correlation has ended.
    pub async fn reconcile(&self, correlation_id: &str) -> Result<bool, CoreError> {
        let Some(root) = self.queue.store().find_latest_root(correlation_id).await? else {
            return Ok(false);
        };

        let (kind, stage) = match (root.is_flow_parent, root.status) {
            (true, JobStatus::Completed) => (EventKind::Completed, STAGE_FLOW_COMPLETED),
            (true, _) => {
                let summary = self.recompute_flow(root.id, None).await?;
                return Ok(summary.map_or(true, |s| s.is_finished()));
            }
            (false, JobStatus::Completed) => (EventKind::Completed, STAGE_COMPLETED),
            (false, JobStatus::Failed) => (EventKind::Failed, STAGE_FAILED),
            (false, JobStatus::Pending | JobStatus::Active) => return Ok(false),
        };

        tracing::debug!(correlation_id, job_id = root.id, stage, "Republishing terminal event");
        self.queue.bus().publish(
            correlation_id,
            ProgressUpdate {
                kind,
                job_id: Some(root.id),
                stage: stage.to_string(),
                percent: Some(root.progress_percent.clamp(0, 100) as u8),
                message: root.error.or(root.progress_message),
                data: root.result,
            },
        );
        Ok(true)
    }

    /// Recover from a lagged lifecycle stream: complete open flows, then
    /// settle every open topic whose job ended while events were dropped.
    async fn catch_up(&self) {
        if let Err(e) = self.sweep().await {
            tracing::error!(error = %e, "Flow sweep failed");
        }
        let open = self.queue.bus().open_correlations();
        let mut settled = 0;
        for correlation_id in &open {
            match self.reconcile(correlation_id).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(correlation_id = %correlation_id, error = %e, "Reconcile failed");
                }
            }
        }
        tracing::info!(open = open.len(), settled, "Lifecycle catch-up finished");
    }

    // -- relay -------------------------------------------------------------

    /// Consume lifecycle events until `cancel` fires.
    ///
    /// Subscribe `events` before any worker starts so no transition is
    /// missed.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<JobEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Flow coordinator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Flow coordinator shutting down");
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => self.relay(event).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Flow coordinator lagged, catching up from the store");
                        self.catch_up().await;
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Lifecycle channel closed, flow coordinator stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Route one lifecycle event.
    pub async fn relay(&self, event: JobEvent) {
        let bus = self.queue.bus();

        let Some(parent_id) = event.parent_id else {
            bus.publish(
                &event.correlation_id,
                ProgressUpdate {
                    kind: event.kind,
                    job_id: Some(event.job_id),
                    stage: event.stage,
                    percent: event.percent,
                    message: event.message,
                    data: event.data,
                },
            );
            return;
        };

        if bus.has_ended(&event.correlation_id, parent_id) {
            // Left over from before the flow completed.
            return;
        }
        if event.kind.is_terminal() {
            if let Err(e) = self.recompute_flow(parent_id, Some(&event)).await {
                tracing::error!(
                    parent_id,
                    child_id = event.job_id,
                    error = %e,
                    "Flow recompute failed",
                );
            }
        } else {
            // Percent is left to the flow aggregate; the child's own progress
            // travels in `data`.
            bus.publish(
                &event.correlation_id,
                ProgressUpdate::new(EventKind::Progress, event.stage)
                    .job(event.job_id)
                    .message(event.message)
                    .data(serde_json::json!({
                        "child_index": event.child_index,
                        "child_total": event.child_total,
                        "child_percent": event.percent,
                        "attempts": event.attempts,
                    })),
            );
        }
    }
}
