//! Job entity models.

use hireflow_core::flow::ChildOutcome;
use hireflow_core::payload::{JobKind, JobPayload};
use hireflow_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::JobStatus;

/// A row from the `jobs` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub queue_name: String,
    #[sqlx(try_from = "String")]
    pub kind: JobKind,
    pub payload: serde_json::Value,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: JobStatus,
    pub correlation_id: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub parent_id: Option<DbId>,
    pub is_flow_parent: bool,
    /// 1-based position within the flow.
    pub child_index: Option<i32>,
    pub child_total: Option<i32>,
    pub progress_percent: i16,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(skip)]
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<Timestamp>,
    pub run_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// The lease currently held on this job, if it is active.
    pub fn lease(&self) -> Option<Lease> {
        match (self.status, self.lease_id, self.lease_expires_at) {
            (JobStatus::Active, Some(lease_id), Some(expires_at)) => Some(Lease {
                job_id: self.id,
                lease_id,
                expires_at,
            }),
            _ => None,
        }
    }

    pub fn child_outcome(&self) -> ChildOutcome {
        match self.status {
            JobStatus::Completed => ChildOutcome::Completed,
            JobStatus::Failed => ChildOutcome::Failed,
            JobStatus::Pending | JobStatus::Active => ChildOutcome::Open,
        }
    }
}

/// Exclusive right to mutate one job, handed out by a dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: DbId,
    pub lease_id: Uuid,
    pub expires_at: Timestamp,
}

/// Input for a standalone job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub payload: JobPayload,
    pub correlation_id: String,
    pub max_attempts: i32,
}

/// Input for a flow: one parent plus its ordered children, created together.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub queue_name: String,
    pub correlation_id: String,
    pub max_attempts: i32,
    pub parent: JobPayload,
    pub children: Vec<JobPayload>,
}
