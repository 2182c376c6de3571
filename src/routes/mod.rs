//! Route definitions for the WafSentry API.

pub mod blocks;
pub mod health;
pub mod ingest;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Compressed log deliveries run a few MB; the cap leaves headroom for
/// uncompressed replays while still rejecting misdirected uploads.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Full application router.
pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ingest/{tenant_id}", post(ingest::deliver))
        .route("/admin/blocks", post(blocks::create).get(blocks::list))
        .route(
            "/admin/blocks/{tenant_id}/{source_ip}",
            delete(blocks::remove),
        );

    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .nest("/api/v1", api)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
