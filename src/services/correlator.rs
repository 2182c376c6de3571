//! Stateful campaign correlation over classified events.
//!
//! The pure core (`apply_event`) computes the next campaign state for one
//! (tenant, source IP) given the current active campaign, the event, and the
//! tenant's correlation parameters. It carries no database access; the
//! persistence layer below maps outcomes onto conditional writes so that
//! concurrent batches and the re-analyzer converge on the store's
//! one-active-campaign invariant.
//!
//! Qualification is edge-triggered: the `just_qualified` signal is computed
//! here, but the authoritative once-per-lifetime claim is the conditional
//! `escalated_at` update in `claim_escalation`.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::campaign::{AttackCampaign, CampaignStatus};
use crate::models::event::SeverityLevel;

/// Correlation thresholds for one tenant.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationParams {
    /// Rolling window measured from the campaign's first event.
    pub window: Duration,
    /// Event count at which a campaign qualifies (with max severity >= High).
    pub event_threshold: i32,
}

/// In-memory campaign state for the pure core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignState {
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: i32,
    pub max_severity: SeverityLevel,
    pub escalated: bool,
}

impl CampaignState {
    fn open(at: DateTime<Utc>, severity: SeverityLevel) -> Self {
        Self {
            started_at: at,
            last_seen_at: at,
            event_count: 1,
            max_severity: severity,
            escalated: false,
        }
    }

    fn qualifies(&self, params: &CorrelationParams) -> bool {
        self.event_count >= params.event_threshold && self.max_severity >= SeverityLevel::High
    }
}

/// Outcome of applying one event to a (tenant, source IP) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationOutcome {
    pub campaign: CampaignState,
    /// True when this event opened a fresh campaign (the previous one, if
    /// any, lapsed outside the window and must be resolved).
    pub started_new: bool,
    /// Edge-triggered: true only on the event that crosses the qualifying
    /// threshold, never on later events of the same campaign.
    pub just_qualified: bool,
}

/// Apply one classified event to the current campaign state.
///
/// Events with identical timestamps are applied in call order; the caller
/// feeds events in delivery order and no reordering happens here.
pub fn apply_event(
    active: Option<CampaignState>,
    event_time: DateTime<Utc>,
    severity: SeverityLevel,
    params: &CorrelationParams,
) -> CorrelationOutcome {
    let (mut campaign, started_new) = match active {
        Some(current) if event_time < current.started_at + params.window => (current, false),
        // No active campaign, or the window elapsed: open a fresh one.
        _ => (CampaignState::open(event_time, severity), true),
    };

    // A just-opened campaign has no prior state to have qualified from;
    // without this, a threshold of 1 would satisfy `qualifies` on open and
    // the edge would never fire.
    let was_qualified = !started_new && (campaign.escalated || campaign.qualifies(params));

    if !started_new {
        campaign.event_count += 1;
        campaign.last_seen_at = campaign.last_seen_at.max(event_time);
        campaign.max_severity = campaign.max_severity.max(severity);
    }

    let just_qualified = !was_qualified && campaign.qualifies(params);

    CorrelationOutcome {
        campaign,
        started_new,
        just_qualified,
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Fetch the single active campaign for a (tenant, source IP), if any.
pub async fn fetch_active(
    pool: &PgPool,
    tenant_id: &str,
    source_ip: &str,
) -> Result<Option<AttackCampaign>, AppError> {
    let campaign = sqlx::query_as::<_, AttackCampaign>(
        r#"
        SELECT * FROM attack_campaigns
        WHERE tenant_id = $1 AND source_ip = $2 AND status = 'active'
        "#,
    )
    .bind(tenant_id)
    .bind(source_ip)
    .fetch_optional(pool)
    .await?;
    Ok(campaign)
}

/// Insert a fresh active campaign. Insert-if-absent: when a concurrent
/// writer already created the active row, the existing row is returned with
/// `created = false` so the caller can re-apply its event as an extension.
pub async fn insert_active(
    pool: &PgPool,
    tenant_id: &str,
    source_ip: &str,
    state: &CampaignState,
) -> Result<(AttackCampaign, bool), AppError> {
    let inserted = sqlx::query_as::<_, AttackCampaign>(
        r#"
        INSERT INTO attack_campaigns
            (tenant_id, source_ip, started_at, last_seen_at, event_count, max_severity, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'active')
        ON CONFLICT (tenant_id, source_ip) WHERE status = 'active' DO NOTHING
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(source_ip)
    .bind(state.started_at)
    .bind(state.last_seen_at)
    .bind(state.event_count)
    .bind(state.max_severity)
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(campaign) => Ok((campaign, true)),
        None => {
            let existing = fetch_active(pool, tenant_id, source_ip)
                .await?
                .ok_or_else(|| {
                    AppError::Internal("Active campaign vanished during insert race".to_string())
                })?;
            Ok((existing, false))
        }
    }
}

/// Extend an active campaign with absolute values computed by the pure core.
pub async fn extend(
    pool: &PgPool,
    campaign_id: Uuid,
    state: &CampaignState,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE attack_campaigns
        SET last_seen_at = $2, event_count = $3, max_severity = $4
        WHERE id = $1 AND status = 'active'
        "#,
    )
    .bind(campaign_id)
    .bind(state.last_seen_at)
    .bind(state.event_count)
    .bind(state.max_severity)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve a stale campaign. Conditional: only flips a still-active row.
pub async fn resolve(pool: &PgPool, campaign_id: Uuid) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE attack_campaigns SET status = 'resolved' WHERE id = $1 AND status = 'active'",
    )
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Resolve every active campaign whose window plus grace period elapsed
/// before `now`. Used by the re-analyzer pass.
pub async fn resolve_stale(
    pool: &PgPool,
    tenant_id: &str,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<u64, AppError> {
    // Grace period is one full window beyond the last seen event.
    let cutoff = now - window - window;
    let result = sqlx::query(
        r#"
        UPDATE attack_campaigns
        SET status = 'resolved'
        WHERE tenant_id = $1 AND status = 'active' AND last_seen_at < $2
        "#,
    )
    .bind(tenant_id)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Claim the qualifying transition for a campaign. Exactly one caller wins
/// across the real-time path and the re-analyzer; everyone else sees `false`
/// and must not escalate.
pub async fn claim_escalation(pool: &PgPool, campaign_id: Uuid) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE attack_campaigns SET escalated_at = NOW() WHERE id = $1 AND escalated_at IS NULL",
    )
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

impl From<&AttackCampaign> for CampaignState {
    fn from(row: &AttackCampaign) -> Self {
        Self {
            started_at: row.started_at,
            last_seen_at: row.last_seen_at,
            event_count: row.event_count,
            max_severity: row.max_severity,
            escalated: row.escalated_at.is_some() || row.status == CampaignStatus::Resolved,
        }
    }
}
