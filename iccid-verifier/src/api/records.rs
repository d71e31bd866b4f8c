//! GET /records

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use iccid_common::db::{RecordStatus, VerificationRecord};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Records returned when no limit is given
const DEFAULT_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct RecordQuery {
    pub batch: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub count: usize,
    pub records: Vec<VerificationRecord>,
}

/// GET /records?batch=&status=&limit=
///
/// Records ordered by id; `limit` between 1 and 10000.
pub async fn query_records(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<Json<RecordsResponse>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<RecordStatus>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let batch = query.batch.as_deref().filter(|b| !b.trim().is_empty());

    let records = state
        .service
        .query_results(batch, status, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(Json(RecordsResponse {
        count: records.len(),
        records,
    }))
}

/// Build record routes
pub fn record_routes() -> Router<AppState> {
    Router::new().route("/records", get(query_records))
}
