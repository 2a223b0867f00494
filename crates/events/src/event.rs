//! Event types carried by the [`EventBus`](crate::EventBus).

use chrono::{DateTime, Utc};
use hireflow_core::job_events::{
    MSG_TYPE_COMPLETED, MSG_TYPE_CONNECTED, MSG_TYPE_FAILED, MSG_TYPE_PROGRESS,
};
use hireflow_core::types::DbId;
use hireflow_db::models::job::Job;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Synthetic first frame of a live connection; never published.
    Connected,
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => MSG_TYPE_CONNECTED,
            EventKind::Progress => MSG_TYPE_PROGRESS,
            EventKind::Completed => MSG_TYPE_COMPLETED,
            EventKind::Failed => MSG_TYPE_FAILED,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed)
    }
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A job status transition or handler progress report.
///
/// Emitted by the queue store on every transition. A `Completed` or `Failed`
/// event here concerns the job itself; whether it ends the correlation's
/// stream is decided by the consumer (a flow child's completion does not).
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub job_id: DbId,
    pub parent_id: Option<DbId>,
    pub correlation_id: String,
    pub queue: String,
    pub stage: String,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
    pub attempts: i32,
    pub child_index: Option<i32>,
    pub child_total: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Build an event describing `job` as it is now.
    pub fn for_job(kind: EventKind, stage: &str, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            parent_id: job.parent_id,
            correlation_id: job.correlation_id.clone(),
            queue: job.queue_name.clone(),
            stage: stage.to_string(),
            percent: Some(job.progress_percent.clamp(0, 100) as u8),
            message: job.progress_message.clone(),
            data: None,
            attempts: job.attempts,
            child_index: job.child_index,
            child_total: job.child_total,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// What a producer hands to [`EventBus::publish`](crate::EventBus::publish).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub kind: EventKind,
    pub job_id: Option<DbId>,
    pub stage: String,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl ProgressUpdate {
    pub fn new(kind: EventKind, stage: impl Into<String>) -> Self {
        Self {
            kind,
            job_id: None,
            stage: stage.into(),
            percent: None,
            message: None,
            data: None,
        }
    }

    pub fn job(mut self, job_id: DbId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }

    pub fn message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A published update, stamped by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub correlation_id: String,
    pub job_id: Option<DbId>,
    pub stage: String,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
    /// Strictly increasing per correlation id, starting at 1.
    pub sequence: u64,
    pub terminal: bool,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// LiveUpdate
// ---------------------------------------------------------------------------

/// JSON frame sent to a live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<DbId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl LiveUpdate {
    pub fn connected(correlation_id: &str) -> Self {
        Self {
            kind: EventKind::Connected,
            correlation_id: correlation_id.to_string(),
            job_id: None,
            stage: None,
            percent: None,
            message: None,
            data: None,
            sequence: None,
            timestamp: Utc::now(),
        }
    }
}

impl From<&ProgressEvent> for LiveUpdate {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            kind: event.kind,
            correlation_id: event.correlation_id.clone(),
            job_id: event.job_id,
            stage: Some(event.stage.clone()),
            percent: event.percent,
            message: event.message.clone(),
            data: event.data.clone(),
            sequence: Some(event.sequence),
            timestamp: event.timestamp,
        }
    }
}
