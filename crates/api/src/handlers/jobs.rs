//! Handlers for the `/jobs` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use hireflow_core::error::CoreError;
use hireflow_core::payload::JobPayload;
use hireflow_core::types::DbId;
use hireflow_worker::EnqueueOptions;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::extract::AppJson;
use crate::response;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub queue: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueuedJob {
    pub job_id: DbId,
    pub correlation_id: String,
}

/// POST /api/v1/jobs
///
/// Validate the payload against its kind and enqueue it. Returns 201 with
/// the job id and the correlation id to subscribe to.
pub async fn enqueue_job(
    State(state): State<AppState>,
    AppJson(input): AppJson<EnqueueJobRequest>,
) -> AppResult<impl IntoResponse> {
    let payload = JobPayload::from_parts(&input.kind, input.payload)?;
    let job = state
        .queue
        .enqueue(
            &input.queue,
            payload,
            EnqueueOptions {
                correlation_id: input.correlation_id,
                max_attempts: input.max_attempts,
            },
        )
        .await?;

    Ok(response::created(EnqueuedJob {
        job_id: job.id,
        correlation_id: job.correlation_id,
    }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .queue
        .get(job_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        }))?;

    Ok(response::ok(job))
}
