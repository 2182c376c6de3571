//! Automated and manual source blocking against the external IP set.
//!
//! A block is persisted first (status pending), then confirmed against the
//! external resource; only a confirmed mutation flips it active. Failures
//! after bounded retries leave the row pending with the error recorded; the
//! sweeper retries those on later passes. The partial unique index on live
//! rows makes the whole operation idempotent per (tenant, source IP).

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::block::{BlockReason, BlockedSource};
use crate::models::tenant::TenantConfig;
use crate::services::ipset::IpSetBackend;

/// Outcome of a block request.
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    /// External mutation confirmed; block is active.
    Applied(BlockedSource),
    /// A live block already existed; no external mutation issued.
    AlreadyBlocked(BlockedSource),
    /// Persisted, but the external mutation failed after retries.
    Pending(BlockedSource),
}

impl BlockOutcome {
    pub fn block(&self) -> &BlockedSource {
        match self {
            Self::Applied(b) | Self::AlreadyBlocked(b) | Self::Pending(b) => b,
        }
    }
}

/// Expiry for a new block. Automatic blocks always get the tenant TTL,
/// counted from creation; manual blocks only expire when a TTL was given.
pub fn compute_expiry(
    reason: BlockReason,
    manual_ttl: Option<Duration>,
    cfg: &TenantConfig,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match reason {
        BlockReason::Automatic => Some(now + cfg.block_ttl()),
        BlockReason::Manual => manual_ttl.map(|ttl| now + ttl),
    }
}

/// Block a source IP for a tenant.
///
/// Idempotent: a live (pending or active) entry short-circuits without a
/// second external mutation. The external write uses the versioned
/// read-modify-write discipline; see `ipset::IpSetBackend::mutate`.
pub async fn block_source(
    pool: &PgPool,
    ipset: &IpSetBackend,
    cfg: &TenantConfig,
    source_ip: &str,
    reason: BlockReason,
    manual_ttl: Option<Duration>,
) -> Result<BlockOutcome, AppError> {
    let expires_at = compute_expiry(reason, manual_ttl, cfg, Utc::now());

    let inserted = sqlx::query_as::<_, BlockedSource>(
        r#"
        INSERT INTO blocked_sources (tenant_id, source_ip, reason, status, expires_at)
        VALUES ($1, $2, $3, 'pending', $4)
        ON CONFLICT (tenant_id, source_ip) WHERE status IN ('pending', 'active') DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&cfg.tenant_id)
    .bind(source_ip)
    .bind(reason)
    .bind(expires_at)
    .fetch_optional(pool)
    .await?;

    let Some(block) = inserted else {
        let existing = fetch_live(pool, &cfg.tenant_id, source_ip)
            .await?
            .ok_or_else(|| {
                AppError::Internal("Live block vanished during insert race".to_string())
            })?;
        tracing::debug!(
            tenant = %cfg.tenant_id,
            source_ip,
            block_id = %existing.id,
            "Block request deduplicated against live entry"
        );
        return Ok(BlockOutcome::AlreadyBlocked(existing));
    };

    match apply_external(pool, ipset, cfg, &block).await {
        Ok(active) => Ok(BlockOutcome::Applied(active)),
        Err(e) => {
            tracing::warn!(
                tenant = %cfg.tenant_id,
                source_ip,
                error = %e,
                "External block mutation failed, leaving entry pending"
            );
            let pending = record_failure(pool, block.id, &e.to_string()).await?;
            Ok(BlockOutcome::Pending(pending))
        }
    }
}

/// Refresh the TTL of an active automatic block. The explicit refresh path:
/// repeated offenses never extend a block implicitly.
pub async fn refresh_ttl(
    pool: &PgPool,
    tenant_id: &str,
    source_ip: &str,
    ttl: Duration,
) -> Result<Option<BlockedSource>, AppError> {
    let refreshed = sqlx::query_as::<_, BlockedSource>(
        r#"
        UPDATE blocked_sources
        SET expires_at = $4
        WHERE tenant_id = $1 AND source_ip = $2 AND status = 'active' AND reason = $3
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(source_ip)
    .bind(BlockReason::Automatic)
    .bind(Utc::now() + ttl)
    .fetch_optional(pool)
    .await?;
    Ok(refreshed)
}

/// Remove a live block: external removal first, then the conditional status
/// flip. Used by the manual unblock operation.
pub async fn unblock_source(
    pool: &PgPool,
    ipset: &IpSetBackend,
    cfg: &TenantConfig,
    source_ip: &str,
) -> Result<BlockedSource, AppError> {
    let block = fetch_live(pool, &cfg.tenant_id, source_ip)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No live block for {source_ip}"))
        })?;

    let ip = block.source_ip.clone();
    ipset
        .mutate(&cfg.ipset_name, move |members| {
            members.retain(|m| m != &ip)
        })
        .await?;

    let removed = sqlx::query_as::<_, BlockedSource>(
        r#"
        UPDATE blocked_sources
        SET status = 'removed'
        WHERE id = $1 AND status IN ('pending', 'active')
        RETURNING *
        "#,
    )
    .bind(block.id)
    .fetch_optional(pool)
    .await?
    .unwrap_or(block);

    Ok(removed)
}

/// The single live (pending or active) block for a (tenant, source IP).
pub async fn fetch_live(
    pool: &PgPool,
    tenant_id: &str,
    source_ip: &str,
) -> Result<Option<BlockedSource>, AppError> {
    let block = sqlx::query_as::<_, BlockedSource>(
        r#"
        SELECT * FROM blocked_sources
        WHERE tenant_id = $1 AND source_ip = $2 AND status IN ('pending', 'active')
        "#,
    )
    .bind(tenant_id)
    .bind(source_ip)
    .fetch_optional(pool)
    .await?;
    Ok(block)
}

/// Live blocks for a tenant, newest first. Backs the admin listing.
pub async fn list_live(pool: &PgPool, tenant_id: &str) -> Result<Vec<BlockedSource>, AppError> {
    let blocks = sqlx::query_as::<_, BlockedSource>(
        r#"
        SELECT * FROM blocked_sources
        WHERE tenant_id = $1 AND status IN ('pending', 'active')
        ORDER BY created_at DESC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(blocks)
}

/// Confirm a pending block against the external resource and activate it.
/// Shared by the real-time path and the sweeper's pending-retry pass.
pub async fn apply_external(
    pool: &PgPool,
    ipset: &IpSetBackend,
    cfg: &TenantConfig,
    block: &BlockedSource,
) -> Result<BlockedSource, AppError> {
    let ip = block.source_ip.clone();
    let version = ipset
        .mutate(&cfg.ipset_name, move |members| {
            if !members.contains(&ip) {
                members.push(ip.clone());
            }
        })
        .await?;

    let external_ref = format!("{}@{version}", cfg.ipset_name);
    let active = sqlx::query_as::<_, BlockedSource>(
        r#"
        UPDATE blocked_sources
        SET status = 'active', external_ref = $2, last_error = NULL
        WHERE id = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(block.id)
    .bind(&external_ref)
    .fetch_optional(pool)
    .await?
    .unwrap_or_else(|| block.clone());

    tracing::info!(
        tenant = %cfg.tenant_id,
        source_ip = %block.source_ip,
        external_ref,
        "Source blocked on external IP set"
    );
    Ok(active)
}

async fn record_failure(
    pool: &PgPool,
    block_id: Uuid,
    error: &str,
) -> Result<BlockedSource, AppError> {
    let block = sqlx::query_as::<_, BlockedSource>(
        "UPDATE blocked_sources SET last_error = $2 WHERE id = $1 RETURNING *",
    )
    .bind(block_id)
    .bind(error)
    .fetch_one(pool)
    .await?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TenantConfig {
        TenantConfig {
            tenant_id: "t1".to_string(),
            ipset_name: "t1-blocklist".to_string(),
            window_secs: 900,
            event_threshold: 5,
            block_ttl_secs: 86400,
            suppression_secs: 1800,
            topic_url: None,
            webhook_url: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn automatic_block_gets_tenant_ttl() {
        let now = Utc::now();
        let expiry = compute_expiry(BlockReason::Automatic, None, &cfg(), now);
        assert_eq!(expiry, Some(now + Duration::hours(24)));
    }

    #[test]
    fn automatic_block_ignores_manual_ttl_override() {
        // TTL policy for automatic blocks is fixed by tenant config.
        let now = Utc::now();
        let expiry = compute_expiry(
            BlockReason::Automatic,
            Some(Duration::minutes(5)),
            &cfg(),
            now,
        );
        assert_eq!(expiry, Some(now + Duration::hours(24)));
    }

    #[test]
    fn manual_block_expiry_is_optional() {
        let now = Utc::now();
        assert_eq!(compute_expiry(BlockReason::Manual, None, &cfg(), now), None);
        assert_eq!(
            compute_expiry(BlockReason::Manual, Some(Duration::hours(1)), &cfg(), now),
            Some(now + Duration::hours(1))
        );
    }
}
