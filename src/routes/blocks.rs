//! Admin routes for manual block management.

use std::net::IpAddr;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{ApiResponse, AppError};
use crate::models::block::{BlockReason, BlockedSource};
use crate::services::{blocker, tenants};
use crate::AppState;

/// Request for a manual block.
#[derive(Debug, Deserialize)]
pub struct ManualBlockRequest {
    pub tenant_id: String,
    pub source_ip: String,
    /// Optional TTL; a manual block without one stays until removed.
    pub ttl_secs: Option<i64>,
}

/// Outcome wrapper so callers can tell a fresh block from a no-op.
#[derive(Debug, Serialize)]
pub struct ManualBlockResult {
    pub outcome: String,
    pub block: BlockedSource,
}

/// Tenant filter for the listing.
#[derive(Debug, Deserialize)]
pub struct BlockListQuery {
    pub tenant_id: String,
}

/// POST /api/v1/admin/blocks — manually block a source IP.
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<ManualBlockRequest>,
) -> Result<Json<ApiResponse<ManualBlockResult>>, AppError> {
    let source_ip = parse_ip(&req.source_ip)?;
    let ttl = match req.ttl_secs {
        Some(secs) if secs <= 0 => {
            return Err(AppError::Validation("ttl_secs must be positive".to_string()));
        }
        Some(secs) => Some(Duration::seconds(secs)),
        None => None,
    };

    let cfg = tenants::get(&state.db, &req.tenant_id).await?;
    let outcome = blocker::block_source(
        &state.db,
        &state.ipset,
        &cfg,
        &source_ip,
        BlockReason::Manual,
        ttl,
    )
    .await?;

    let label = match &outcome {
        blocker::BlockOutcome::Applied(_) => "applied",
        blocker::BlockOutcome::AlreadyBlocked(_) => "already_blocked",
        blocker::BlockOutcome::Pending(_) => "pending",
    };
    Ok(ApiResponse::success(ManualBlockResult {
        outcome: label.to_string(),
        block: outcome.block().clone(),
    }))
}

/// DELETE /api/v1/admin/blocks/{tenant_id}/{source_ip} — remove a live block.
pub async fn remove(
    State(state): State<AppState>,
    Path((tenant_id, source_ip)): Path<(String, String)>,
) -> Result<Json<ApiResponse<BlockedSource>>, AppError> {
    let source_ip = parse_ip(&source_ip)?;
    let cfg = tenants::get(&state.db, &tenant_id).await?;
    let removed = blocker::unblock_source(&state.db, &state.ipset, &cfg, &source_ip).await?;
    Ok(ApiResponse::success(removed))
}

/// GET /api/v1/admin/blocks?tenant_id= — list live blocks for a tenant.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<BlockListQuery>,
) -> Result<Json<ApiResponse<Vec<BlockedSource>>>, AppError> {
    let blocks = blocker::list_live(&state.db, &query.tenant_id).await?;
    Ok(ApiResponse::success(blocks))
}

/// Canonical textual form of a validated IP address.
fn parse_ip(raw: &str) -> Result<String, AppError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| AppError::Validation(format!("Invalid IP address '{raw}'")))
}
