pub mod flows;
pub mod health;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws/{correlation_id}     live updates (WebSocket)
///
/// /jobs                    enqueue (POST)
/// /jobs/{id}               job status (GET)
///
/// /flows                   create flow (POST)
/// /flows/{id}              flow summary (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/{correlation_id}", get(ws::ws_handler))
        .nest("/jobs", jobs::router())
        .nest("/flows", flows::router())
}
