//! GET /runs - background runs owned by this process

use axum::{extract::State, routing::get, Json, Router};

use crate::coordinator::RunInfo;
use crate::AppState;

pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunInfo>> {
    Json(state.service.active_runs().await)
}

/// Build run routes
pub fn run_routes() -> Router<AppState> {
    Router::new().route("/runs", get(list_runs))
}
