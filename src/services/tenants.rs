//! Tenant configuration access.
//!
//! Configuration rows are written by the external setup flow; the pipeline
//! only reads them. A missing row is the one fatal, per-tenant error in the
//! taxonomy: the batch for that tenant aborts, logged distinctly from
//! data-level errors.

use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::tenant::TenantConfig;

/// Fetch one tenant's configuration. `AppError::Config` when absent or
/// disabled.
pub async fn get(pool: &PgPool, tenant_id: &str) -> Result<TenantConfig, AppError> {
    let cfg = sqlx::query_as::<_, TenantConfig>(
        "SELECT * FROM tenant_configs WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Config(format!("No configuration for tenant {tenant_id}")))?;

    if !cfg.enabled {
        return Err(AppError::Config(format!("Tenant {tenant_id} is disabled")));
    }
    Ok(cfg)
}

/// All enabled tenants, for the periodic schedulers.
pub async fn list_enabled(pool: &PgPool) -> Result<Vec<TenantConfig>, AppError> {
    let configs = sqlx::query_as::<_, TenantConfig>(
        "SELECT * FROM tenant_configs WHERE enabled = TRUE ORDER BY tenant_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(configs)
}
