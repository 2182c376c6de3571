//! Application configuration loaded from environment variables.
//!
//! Per-tenant thresholds and channel endpoints live in the database
//! (`tenant_configs`), not here; see `services::tenants`.

use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub host: String,
    pub port: u16,
    /// Base URL of the firewall's IP-set API. When unset the in-memory
    /// backend is used (dev/test).
    pub ipset_api_url: Option<String>,
    /// Wall-clock budget for one delivery batch, in milliseconds.
    pub batch_budget_ms: u64,
    pub sweep_interval_secs: u64,
    pub reanalyze_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            host: env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("BACKEND_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            ipset_api_url: env::var("IPSET_API_URL").ok(),
            batch_budget_ms: env::var("BATCH_BUDGET_MS")
                .unwrap_or_else(|_| "25000".to_string())
                .parse()
                .unwrap_or(25000),
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            reanalyze_interval_secs: env::var("REANALYZE_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
        })
    }
}
