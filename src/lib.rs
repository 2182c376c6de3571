pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod parsers;
pub mod routes;
pub mod services;

use sqlx::PgPool;

use crate::services::ipset::IpSetBackend;

/// Shared application state passed to all Axum handlers and schedulers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: config::AppConfig,
    pub ipset: IpSetBackend,
    pub http: reqwest::Client,
}
