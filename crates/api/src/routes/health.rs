use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Body of `GET /health`.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the job store cannot be reached.
    pub status: &'static str,
    pub version: &'static str,
    pub store_healthy: bool,
    /// Open live-update sockets.
    pub live_connections: usize,
    /// Correlation ids with retained bus state.
    pub open_topics: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = state
        .queue
        .store()
        .health_check()
        .await
        .inspect_err(|e| tracing::warn!(error = %e, "Job store health check failed"))
        .is_ok();

    Json(HealthResponse {
        status: if store_healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        store_healthy,
        live_connections: state.broadcaster.connection_count().await,
        open_topics: state.event_bus.topic_count(),
    })
}

/// Root-level `/health`, outside the versioned API.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
