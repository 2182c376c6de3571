//! Event persistence. Rows are insert-only; classification is written at
//! creation and never mutated afterwards.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::event::{Event, NewEvent};
use crate::services::detector::Classification;

/// Insert one classified event.
pub async fn insert(
    pool: &PgPool,
    tenant_id: &str,
    event: &NewEvent,
    classification: &Classification,
) -> Result<Event, AppError> {
    let row = sqlx::query_as::<_, Event>(
        r#"
        INSERT INTO events
            (tenant_id, occurred_at, source_ip, uri, http_method, rule_id,
             action, category, severity, raw_ref, region)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(event.occurred_at)
    .bind(&event.source_ip)
    .bind(&event.uri)
    .bind(&event.http_method)
    .bind(&event.rule_id)
    .bind(event.action)
    .bind(classification.category)
    .bind(classification.severity)
    .bind(&event.raw_ref)
    .bind(&event.region)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Classified events in the trailing window, in replay order: occurrence
/// time first, then insertion order as the delivery-order tie-break.
pub async fn fetch_classified_window(
    pool: &PgPool,
    tenant_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Event>, AppError> {
    let rows = sqlx::query_as::<_, Event>(
        r#"
        SELECT * FROM events
        WHERE tenant_id = $1 AND occurred_at >= $2 AND category IS NOT NULL
        ORDER BY occurred_at ASC, created_at ASC
        "#,
    )
    .bind(tenant_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-category counts of low/medium classified activity since `since`,
/// feeding the periodic digest.
pub async fn digest_counts(
    pool: &PgPool,
    tenant_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<(String, i64)>, AppError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT category::TEXT, COUNT(*)
        FROM events
        WHERE tenant_id = $1 AND occurred_at >= $2
          AND category IS NOT NULL AND severity IN ('low', 'medium')
        GROUP BY category
        ORDER BY COUNT(*) DESC
        "#,
    )
    .bind(tenant_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
