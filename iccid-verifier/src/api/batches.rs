//! Batch endpoints
//!
//! POST /batches, GET /batches, GET|DELETE /batches/:batch and the
//! lifecycle actions under /batches/:batch/.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use iccid_common::db::{BatchProcess, RecordStatus};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::models::{BatchOverview, DeleteReport, LoadReport};
use crate::AppState;

/// POST /batches request
#[derive(Debug, Deserialize)]
pub struct LoadBatchRequest {
    pub name: String,
    pub identifiers: Vec<String>,
}

/// POST /batches/:batch/start request (body optional)
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Verify at most this many pending records
    pub cap: Option<u64>,
}

/// POST /batches/:batch/reset request (body optional)
#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    /// Only reset records currently in this status
    pub status: Option<RecordStatus>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub batch: String,
    pub reset: u64,
}

/// POST /batches
pub async fn load_batch(
    State(state): State<AppState>,
    Json(request): Json<LoadBatchRequest>,
) -> ApiResult<Json<LoadReport>> {
    let report = state
        .service
        .load_batch(&request.name, &request.identifiers)
        .await?;
    Ok(Json(report))
}

/// GET /batches
pub async fn list_batches(State(state): State<AppState>) -> ApiResult<Json<Vec<BatchOverview>>> {
    Ok(Json(state.service.list_batches().await?))
}

/// GET /batches/:batch
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> ApiResult<Json<BatchOverview>> {
    Ok(Json(state.service.batch_overview(&batch).await?))
}

/// DELETE /batches/:batch
pub async fn delete_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> ApiResult<Json<DeleteReport>> {
    Ok(Json(state.service.delete_batch(&batch).await?))
}

/// POST /batches/:batch/start
///
/// Claims the batch and verifies in the background. Returns 202 with the
/// freshly launched lifecycle row.
pub async fn start_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    request: Option<Json<StartRequest>>,
) -> ApiResult<(StatusCode, Json<BatchProcess>)> {
    let Json(request) = request.unwrap_or_default();
    let process = state.service.start_verification(&batch, request.cap).await?;

    tracing::info!(
        batch = %batch,
        total = process.progress_total,
        "Verification started"
    );

    Ok((StatusCode::ACCEPTED, Json(process)))
}

/// POST /batches/:batch/pause
pub async fn pause_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> ApiResult<Json<BatchProcess>> {
    Ok(Json(state.service.pause(&batch).await?))
}

/// POST /batches/:batch/resume
pub async fn resume_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> ApiResult<Json<BatchProcess>> {
    Ok(Json(state.service.resume(&batch).await?))
}

/// POST /batches/:batch/stop
pub async fn stop_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> ApiResult<Json<BatchProcess>> {
    Ok(Json(state.service.stop(&batch).await?))
}

/// POST /batches/:batch/reset
pub async fn reset_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    request: Option<Json<ResetRequest>>,
) -> ApiResult<Json<ResetResponse>> {
    let Json(request) = request.unwrap_or_default();
    let reset = state.service.reset_batch(&batch, request.status).await?;
    Ok(Json(ResetResponse { batch, reset }))
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/batches", post(load_batch).get(list_batches))
        .route("/batches/:batch", get(get_batch).delete(delete_batch))
        .route("/batches/:batch/start", post(start_batch))
        .route("/batches/:batch/pause", post(pause_batch))
        .route("/batches/:batch/resume", post(resume_batch))
        .route("/batches/:batch/stop", post(stop_batch))
        .route("/batches/:batch/reset", post(reset_batch))
}
