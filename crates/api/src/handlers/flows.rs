//! Handlers for the `/flows` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use hireflow_core::error::CoreError;
use hireflow_core::payload::JobPayload;
use hireflow_core::types::DbId;
use hireflow_worker::EnqueueOptions;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::extract::AppJson;
use crate::response;
use crate::state::AppState;

/// A `{kind, payload}` pair inside a flow request.
#[derive(Debug, Deserialize)]
pub struct TypedPayload {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TypedPayload {
    fn into_payload(self, field: &str) -> Result<JobPayload, CoreError> {
        JobPayload::from_parts(&self.kind, self.payload).map_err(|e| match e {
            CoreError::Validation(msg) => CoreError::Validation(format!("{field}: {msg}")),
            other => other,
        })
    }
}

/// Request body for `POST /api/v1/flows`.
#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    pub queue: String,
    pub correlation_id: Option<String>,
    pub max_attempts: Option<i32>,
    pub parent_payload: TypedPayload,
    pub children: Vec<TypedPayload>,
}

#[derive(Debug, Serialize)]
pub struct CreatedFlowResponse {
    pub parent_id: DbId,
    pub child_ids: Vec<DbId>,
    pub correlation_id: String,
}

/// POST /api/v1/flows
///
/// Create a parent job and its children atomically. Every payload is
/// validated first; one bad child rejects the whole flow.
pub async fn create_flow(
    State(state): State<AppState>,
    AppJson(input): AppJson<CreateFlowRequest>,
) -> AppResult<impl IntoResponse> {
    let parent = input.parent_payload.into_payload("parent_payload")?;
    let children = input
        .children
        .into_iter()
        .enumerate()
        .map(|(i, child)| child.into_payload(&format!("children[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    let created = state
        .coordinator
        .create_flow(
            &input.queue,
            parent,
            children,
            EnqueueOptions {
                correlation_id: input.correlation_id,
                max_attempts: input.max_attempts,
            },
        )
        .await?;

    Ok(response::created(CreatedFlowResponse {
        parent_id: created.parent.id,
        child_ids: created.children.iter().map(|c| c.id).collect(),
        correlation_id: created.parent.correlation_id,
    }))
}

/// GET /api/v1/flows/{id}
pub async fn get_flow(
    State(state): State<AppState>,
    Path(parent_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let summary = state.coordinator.flow_summary(parent_id).await?;
    Ok(response::ok(summary))
}
