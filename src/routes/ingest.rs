//! Ingest route: receives raw WAF log deliveries and runs the pipeline.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};

use crate::errors::{ApiResponse, AppError};
use crate::services::pipeline::{self, BatchSummary};
use crate::AppState;

/// POST /api/v1/ingest/{tenant_id} — process one log delivery batch.
///
/// The body is the raw delivery payload: gzip or plain, a records envelope,
/// a JSON array, a single object, or NDJSON. Individual malformed records
/// are reported in the summary, not rejected wholesale; only an unreadable
/// payload or an unknown/disabled tenant fails the request.
pub async fn deliver(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<BatchSummary>>, AppError> {
    if body.is_empty() {
        return Err(AppError::Validation("Empty delivery payload".to_string()));
    }

    let summary = pipeline::process_delivery(&state, &tenant_id, &body).await?;
    Ok(ApiResponse::success(summary))
}
