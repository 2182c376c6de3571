//! Periodic blocklist maintenance: expiry removal and pending retries.
//!
//! One tenant's external resource is processed at a time; concurrency with
//! the real-time path (and other sweeper instances) is handled entirely by
//! the IP set's version token. A removal failure leaves the entry active
//! and is retried on the next scheduled run, never looped immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::block::BlockedSource;
use crate::models::tenant::TenantConfig;
use crate::services::{blocker, ipset::IpSetBackend, tenants};

/// Counters for one sweep pass over one tenant.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    pub expired_removed: usize,
    pub removal_failures: usize,
    pub pending_retried: usize,
    pub pending_activated: usize,
}

/// Sweep every enabled tenant once.
pub async fn run_pass(pool: &PgPool, ipset: &IpSetBackend) -> Result<(), AppError> {
    let now = Utc::now();
    for cfg in tenants::list_enabled(pool).await? {
        match sweep_tenant(pool, ipset, &cfg, now).await {
            Ok(summary) => {
                if summary.expired_removed > 0 || summary.pending_retried > 0 {
                    tracing::info!(
                        tenant = %cfg.tenant_id,
                        expired_removed = summary.expired_removed,
                        removal_failures = summary.removal_failures,
                        pending_activated = summary.pending_activated,
                        "Sweep pass completed"
                    );
                }
            }
            Err(e) => {
                tracing::error!(tenant = %cfg.tenant_id, error = %e, "Sweep pass failed");
            }
        }
    }
    Ok(())
}

/// Sweep one tenant: remove expired active blocks from the external IP set
/// and the store, then retry pending entries whose external mutation never
/// succeeded.
pub async fn sweep_tenant(
    pool: &PgPool,
    ipset: &IpSetBackend,
    cfg: &TenantConfig,
    now: DateTime<Utc>,
) -> Result<SweepSummary, AppError> {
    let mut summary = SweepSummary::default();

    for block in fetch_expired(pool, &cfg.tenant_id, now).await? {
        let ip = block.source_ip.clone();
        let removal = ipset
            .mutate(&cfg.ipset_name, move |members| {
                members.retain(|m| m != &ip)
            })
            .await;

        match removal {
            Ok(_) => {
                let flipped = sqlx::query(
                    "UPDATE blocked_sources SET status = 'expired' WHERE id = $1 AND status = 'active'",
                )
                .bind(block.id)
                .execute(pool)
                .await?;
                if flipped.rows_affected() == 1 {
                    summary.expired_removed += 1;
                    tracing::info!(
                        tenant = %cfg.tenant_id,
                        source_ip = %block.source_ip,
                        "Expired block removed"
                    );
                }
            }
            Err(e) => {
                summary.removal_failures += 1;
                tracing::warn!(
                    tenant = %cfg.tenant_id,
                    source_ip = %block.source_ip,
                    error = %e,
                    "Expired block removal failed, will retry next run"
                );
                sqlx::query("UPDATE blocked_sources SET last_error = $2 WHERE id = $1")
                    .bind(block.id)
                    .bind(e.to_string())
                    .execute(pool)
                    .await?;
            }
        }
    }

    // Pending entries: the external add never succeeded; a pending entry
    // whose TTL already elapsed is tidied up without touching the IP set.
    for block in fetch_pending(pool, &cfg.tenant_id).await? {
        if block.is_expired_at(now) {
            sqlx::query(
                "UPDATE blocked_sources SET status = 'expired' WHERE id = $1 AND status = 'pending'",
            )
            .bind(block.id)
            .execute(pool)
            .await?;
            continue;
        }

        summary.pending_retried += 1;
        match blocker::apply_external(pool, ipset, cfg, &block).await {
            Ok(_) => summary.pending_activated += 1,
            Err(e) => {
                tracing::warn!(
                    tenant = %cfg.tenant_id,
                    source_ip = %block.source_ip,
                    error = %e,
                    "Pending block retry failed"
                );
            }
        }
    }

    Ok(summary)
}

async fn fetch_expired(
    pool: &PgPool,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<BlockedSource>, AppError> {
    let rows = sqlx::query_as::<_, BlockedSource>(
        r#"
        SELECT * FROM blocked_sources
        WHERE tenant_id = $1 AND status = 'active'
          AND expires_at IS NOT NULL AND expires_at <= $2
        ORDER BY expires_at ASC
        "#,
    )
    .bind(tenant_id)
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn fetch_pending(pool: &PgPool, tenant_id: &str) -> Result<Vec<BlockedSource>, AppError> {
    let rows = sqlx::query_as::<_, BlockedSource>(
        r#"
        SELECT * FROM blocked_sources
        WHERE tenant_id = $1 AND status = 'pending'
        ORDER BY created_at ASC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
