use axum::routing::{get, post};
use axum::Router;

use crate::handlers::flows;
use crate::state::AppState;

/// Routes mounted at `/flows`.
///
/// ```text
/// POST   /                -> create_flow
/// GET    /{id}            -> get_flow
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(flows::create_flow))
        .route("/{id}", get(flows::get_flow))
}
