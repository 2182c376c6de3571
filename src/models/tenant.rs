//! Per-tenant pipeline configuration.
//!
//! Provided by the (out-of-scope) setup flow and consumed read-only by the
//! pipeline: fetched once at batch start and passed by value, never cached
//! in process state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantConfig {
    pub tenant_id: String,
    /// Name of the tenant's external blocklist resource (IP set).
    pub ipset_name: String,
    pub window_secs: i64,
    pub event_threshold: i32,
    pub block_ttl_secs: i64,
    pub suppression_secs: i64,
    pub topic_url: Option<String>,
    pub webhook_url: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TenantConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }

    pub fn block_ttl(&self) -> Duration {
        Duration::seconds(self.block_ttl_secs)
    }

    pub fn suppression(&self) -> Duration {
        Duration::seconds(self.suppression_secs)
    }
}
