//! Periodic campaign re-analysis over the trailing window of persisted
//! events.
//!
//! The real-time path correlates within one delivery batch at a time; bursts
//! smeared across batch boundaries (or deferred by the batch budget) can
//! cross the qualifying threshold without any single invocation noticing.
//! This pass replays the pure correlator over each source's trailing events
//! and claims escalation through the same `escalated_at` conditional update
//! as the real-time path, so double-processing is safe by construction.
//!
//! It also resolves campaigns that lapsed past their grace period and emits
//! the medium/low activity digest the real-time path deliberately skips.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::event::Event;
use crate::models::tenant::TenantConfig;
use crate::services::correlator::{self, CampaignState, CorrelationParams};
use crate::services::dispatcher::{self, Occurrence};
use crate::services::{events, pipeline, tenants};
use crate::AppState;

/// Counters for one re-analysis pass over one tenant.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReanalysisSummary {
    pub sources_examined: usize,
    pub campaigns_qualified: usize,
    pub stale_resolved: u64,
    pub digest_sent: bool,
}

/// Re-analyze every enabled tenant once.
pub async fn run_pass(state: &AppState) -> Result<(), AppError> {
    let now = Utc::now();
    for cfg in tenants::list_enabled(&state.db).await? {
        match reanalyze_tenant(state, &cfg, now).await {
            Ok(summary) => {
                if summary.campaigns_qualified > 0 || summary.stale_resolved > 0 {
                    tracing::info!(
                        tenant = %cfg.tenant_id,
                        sources = summary.sources_examined,
                        qualified = summary.campaigns_qualified,
                        stale_resolved = summary.stale_resolved,
                        "Re-analysis pass completed"
                    );
                }
            }
            Err(e) => {
                tracing::error!(tenant = %cfg.tenant_id, error = %e, "Re-analysis pass failed");
            }
        }
    }
    Ok(())
}

/// One tenant's pass: stale resolution, per-source replay, digest.
pub async fn reanalyze_tenant(
    state: &AppState,
    cfg: &TenantConfig,
    now: DateTime<Utc>,
) -> Result<ReanalysisSummary, AppError> {
    let mut summary = ReanalysisSummary::default();

    summary.stale_resolved =
        correlator::resolve_stale(&state.db, &cfg.tenant_id, cfg.window(), now).await?;

    let since = now - cfg.window();
    let window_events =
        events::fetch_classified_window(&state.db, &cfg.tenant_id, since).await?;

    for (source_ip, source_events) in group_by_source(&window_events) {
        summary.sources_examined += 1;
        if let Err(e) =
            replay_source(state, cfg, source_ip, &source_events, &mut summary).await
        {
            tracing::error!(
                tenant = %cfg.tenant_id,
                source_ip,
                error = %e,
                "Source replay failed, continuing pass"
            );
        }
    }

    let digest_lookback = Duration::seconds(state.config.reanalyze_interval_secs as i64);
    summary.digest_sent = send_digest(&state.db, &state.http, cfg, now, digest_lookback).await?;
    Ok(summary)
}

/// Group events by source IP, preserving replay order within each source.
/// BTreeMap keeps cross-source iteration deterministic.
fn group_by_source(window_events: &[Event]) -> BTreeMap<&str, Vec<&Event>> {
    let mut by_source: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in window_events {
        by_source.entry(&event.source_ip).or_default().push(event);
    }
    by_source
}

/// Replay one source's trailing events through the pure correlator and
/// reconcile the result with the persisted campaign.
async fn replay_source(
    state: &AppState,
    cfg: &TenantConfig,
    source_ip: &str,
    source_events: &[&Event],
    summary: &mut ReanalysisSummary,
) -> Result<(), AppError> {
    let params = CorrelationParams {
        window: cfg.window(),
        event_threshold: cfg.event_threshold,
    };

    let mut replayed: Option<CampaignState> = None;
    let mut qualifies = false;
    for event in source_events {
        let outcome =
            correlator::apply_event(replayed, event.occurred_at, event.severity, &params);
        qualifies = (qualifies && !outcome.started_new) || outcome.just_qualified;
        replayed = Some(outcome.campaign);
    }

    let Some(computed) = replayed else {
        return Ok(());
    };
    if !qualifies {
        return Ok(());
    }

    // Reconcile: reuse the persisted active campaign when it covers the
    // replayed window, otherwise create it. Counts are written as the
    // replayed absolute values, never incremented, so reprocessing the same
    // events cannot inflate them.
    let active = correlator::fetch_active(&state.db, &cfg.tenant_id, source_ip).await?;
    let campaign = match active {
        Some(row) if row.is_escalated() => return Ok(()),
        Some(row) => {
            let merged = CampaignState {
                started_at: row.started_at.min(computed.started_at),
                last_seen_at: row.last_seen_at.max(computed.last_seen_at),
                event_count: row.event_count.max(computed.event_count),
                max_severity: row.max_severity.max(computed.max_severity),
                escalated: false,
            };
            correlator::extend(&state.db, row.id, &merged).await?;
            row
        }
        None => {
            let (row, _created) =
                correlator::insert_active(&state.db, &cfg.tenant_id, source_ip, &computed)
                    .await?;
            row
        }
    };

    if campaign.is_escalated() {
        return Ok(());
    }

    let mut batch = pipeline::BatchSummary::default();
    pipeline::try_escalate(state, cfg, &campaign, &computed, &mut batch).await;
    summary.campaigns_qualified += batch.escalations;
    Ok(())
}

/// Start of the digest window: everything since the previous delivered
/// digest, falling back to one pass interval for a tenant that has never
/// had one. Suppression can hold a digest back for several passes; anchoring
/// on the last dispatch keeps the eventually delivered digest covering the
/// whole gap.
fn digest_since(
    last_dispatched: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback: Duration,
) -> DateTime<Utc> {
    last_dispatched.unwrap_or(now - lookback)
}

/// Send the low/medium digest when there was any such activity since the
/// previous digest. The alert-record claim on the digest subject arbitrates
/// delivery across overlapping passes.
async fn send_digest(
    pool: &PgPool,
    http: &reqwest::Client,
    cfg: &TenantConfig,
    now: DateTime<Utc>,
    lookback: Duration,
) -> Result<bool, AppError> {
    let last =
        dispatcher::last_dispatch_time(pool, &cfg.tenant_id, &Occurrence::digest_subject(&cfg.tenant_id))
            .await?;
    let since = digest_since(last, now, lookback);
    let counts = events::digest_counts(pool, &cfg.tenant_id, since).await?;
    if counts.is_empty() {
        return Ok(false);
    }

    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let summary_text = counts
        .iter()
        .map(|(category, n)| format!("{category}: {n}"))
        .collect::<Vec<_>>()
        .join(", ");

    let occurrence = Occurrence::Digest {
        summary: summary_text,
        event_count: total,
    };
    let outcomes = dispatcher::dispatch(pool, http, cfg, &occurrence).await?;
    Ok(outcomes
        .iter()
        .any(|o| o.status == dispatcher::ChannelStatus::Dispatched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{FirewallAction, SeverityLevel, ThreatCategory};
    use uuid::Uuid;

    fn event(source_ip: &str, minute: i64, severity: SeverityLevel) -> Event {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute);
        Event {
            id: Uuid::new_v4(),
            tenant_id: "t1".to_string(),
            occurred_at: at,
            source_ip: source_ip.to_string(),
            uri: "/".to_string(),
            http_method: "GET".to_string(),
            rule_id: None,
            action: FirewallAction::Block,
            category: Some(ThreatCategory::SqlInjection),
            severity,
            raw_ref: None,
            region: None,
            created_at: at,
        }
    }

    #[test]
    fn grouping_preserves_order_within_source() {
        let rows = vec![
            event("203.0.113.9", 0, SeverityLevel::High),
            event("198.51.100.4", 1, SeverityLevel::Low),
            event("203.0.113.9", 2, SeverityLevel::High),
        ];
        let grouped = group_by_source(&rows);
        assert_eq!(grouped.len(), 2);
        let nine = &grouped["203.0.113.9"];
        assert_eq!(nine.len(), 2);
        assert!(nine[0].occurred_at < nine[1].occurred_at);
    }

    #[test]
    fn digest_window_spans_back_to_the_previous_digest() {
        let now = Utc::now();
        let interval = Duration::seconds(300);

        // Suppression held the digest back for several passes: the window
        // still reaches back to the one that was actually delivered.
        let last = now - Duration::seconds(1800);
        assert_eq!(digest_since(Some(last), now, interval), last);

        // First digest ever: one pass interval.
        assert_eq!(digest_since(None, now, interval), now - interval);
    }

    #[test]
    fn grouping_is_deterministic() {
        let rows = vec![
            event("b.b.b.b", 0, SeverityLevel::Low),
            event("a.a.a.a", 0, SeverityLevel::Low),
        ];
        let keys: Vec<_> = group_by_source(&rows).keys().copied().collect();
        assert_eq!(keys, vec!["a.a.a.a", "b.b.b.b"]);
    }
}
