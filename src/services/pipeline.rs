//! Real-time batch orchestration: envelope → parser → detector → correlator
//! → (blocker, dispatcher) → persistence.
//!
//! One invocation handles one delivery batch for one tenant. Invocations are
//! stateless; any number may run concurrently, for the same tenant or
//! different ones. Blocker and dispatcher failures never abort processing of
//! subsequent events; only a missing tenant configuration fails the batch.

use std::time::{Duration as StdDuration, Instant};

use serde::Serialize;

use crate::errors::AppError;
use crate::models::campaign::AttackCampaign;
use crate::models::event::{Event, SeverityLevel};
use crate::models::tenant::TenantConfig;
use crate::parsers::{envelope, waf_log, RecordError};
use crate::services::detector::{Classification, ThreatDetector};
use crate::services::{blocker, correlator, dispatcher, events, tenants};
use crate::services::blocker::BlockOutcome;
use crate::services::correlator::{CampaignState, CorrelationParams};
use crate::services::dispatcher::Occurrence;
use crate::AppState;

/// Per-stage outcome counters for one delivery batch.
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total_records: usize,
    pub parse_errors: Vec<RecordError>,
    pub persisted: usize,
    pub classified: usize,
    pub campaigns_started: usize,
    pub escalations: usize,
    pub blocks_applied: usize,
    pub blocks_pending: usize,
    /// Events persisted with classification but whose correlation was
    /// deferred to the re-analyzer because the batch budget ran out.
    pub deferred: usize,
}

/// Process one delivery batch end to end.
pub async fn process_delivery(
    state: &AppState,
    tenant_id: &str,
    payload: &[u8],
) -> Result<BatchSummary, AppError> {
    let cfg = tenants::get(&state.db, tenant_id).await?;

    let records = envelope::decode(payload)?;
    let batch = waf_log::parse_batch(&records);

    let mut summary = BatchSummary {
        total_records: records.len(),
        parse_errors: batch.errors,
        ..Default::default()
    };
    for err in &summary.parse_errors {
        tracing::warn!(
            tenant = tenant_id,
            record_index = err.record_index,
            field = %err.field,
            "Malformed log record skipped"
        );
    }

    let detector = ThreatDetector::new();
    let deadline = Instant::now() + StdDuration::from_millis(state.config.batch_budget_ms);

    for event in &batch.events {
        let classification = detector.classify(event);

        // Classification and persistence are cheap and always happen;
        // correlation and external mutations stop once the budget elapses
        // so deferred events reach the re-analyzer instead of being dropped.
        let stored = events::insert(&state.db, tenant_id, event, &classification).await?;
        summary.persisted += 1;

        let Some(category) = classification.category else {
            continue;
        };
        summary.classified += 1;

        if Instant::now() >= deadline {
            summary.deferred += 1;
            continue;
        }

        if let Err(e) = correlate_event(state, &cfg, &stored, &classification, &mut summary).await
        {
            tracing::error!(
                tenant = tenant_id,
                source_ip = %stored.source_ip,
                error = %e,
                "Correlation stage failed for event, continuing batch"
            );
        }

        if classification.severity == SeverityLevel::Critical {
            let occurrence = Occurrence::CriticalEvent {
                event_id: stored.id,
                source_ip: stored.source_ip.clone(),
                category,
            };
            if let Err(e) =
                dispatcher::dispatch(&state.db, &state.http, &cfg, &occurrence).await
            {
                tracing::error!(tenant = tenant_id, error = %e, "Critical-event dispatch failed");
            }
        }
    }

    tracing::info!(
        tenant = tenant_id,
        total = summary.total_records,
        persisted = summary.persisted,
        classified = summary.classified,
        escalations = summary.escalations,
        deferred = summary.deferred,
        "Delivery batch processed"
    );
    Ok(summary)
}

/// Run one classified event through the correlator and, on the qualifying
/// edge, through escalation.
async fn correlate_event(
    state: &AppState,
    cfg: &TenantConfig,
    event: &Event,
    classification: &Classification,
    summary: &mut BatchSummary,
) -> Result<(), AppError> {
    let params = CorrelationParams {
        window: cfg.window(),
        event_threshold: cfg.event_threshold,
    };

    let active = correlator::fetch_active(&state.db, &cfg.tenant_id, &event.source_ip).await?;
    let outcome = correlator::apply_event(
        active.as_ref().map(CampaignState::from),
        event.occurred_at,
        classification.severity,
        &params,
    );

    let campaign = if outcome.started_new {
        if let Some(stale) = &active {
            correlator::resolve(&state.db, stale.id).await?;
        }
        let (row, created) = correlator::insert_active(
            &state.db,
            &cfg.tenant_id,
            &event.source_ip,
            &outcome.campaign,
        )
        .await?;
        if created {
            summary.campaigns_started += 1;
            row
        } else {
            // Lost the insert race: re-apply against the winner's state.
            let merged = correlator::apply_event(
                Some(CampaignState::from(&row)),
                event.occurred_at,
                classification.severity,
                &params,
            );
            correlator::extend(&state.db, row.id, &merged.campaign).await?;
            if merged.just_qualified {
                try_escalate(state, cfg, &row, &merged.campaign, summary).await;
            }
            return Ok(());
        }
    } else if let Some(row) = active {
        correlator::extend(&state.db, row.id, &outcome.campaign).await?;
        row
    } else {
        return Err(AppError::Internal(
            "Correlator extended a nonexistent campaign".to_string(),
        ));
    };

    if outcome.just_qualified {
        try_escalate(state, cfg, &campaign, &outcome.campaign, summary).await;
    }
    Ok(())
}

/// Claim the edge-triggered escalation and, if won, block and alert.
/// Shared by the real-time path and the re-analyzer; both paths are
/// idempotent, so double invocation is safe.
pub async fn try_escalate(
    state: &AppState,
    cfg: &TenantConfig,
    campaign: &AttackCampaign,
    computed: &CampaignState,
    summary: &mut BatchSummary,
) {
    let claimed = match correlator::claim_escalation(&state.db, campaign.id).await {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::error!(
                tenant = %cfg.tenant_id,
                campaign_id = %campaign.id,
                error = %e,
                "Escalation claim failed"
            );
            return;
        }
    };
    if !claimed {
        return;
    }
    summary.escalations += 1;

    tracing::info!(
        tenant = %cfg.tenant_id,
        source_ip = %campaign.source_ip,
        campaign_id = %campaign.id,
        event_count = computed.event_count,
        max_severity = %computed.max_severity,
        "Campaign crossed qualifying threshold"
    );

    let occurrence = Occurrence::CampaignQualified {
        campaign_id: campaign.id,
        source_ip: campaign.source_ip.clone(),
        severity: computed.max_severity,
        event_count: computed.event_count,
    };
    if let Err(e) = dispatcher::dispatch(&state.db, &state.http, cfg, &occurrence).await {
        tracing::error!(tenant = %cfg.tenant_id, error = %e, "Campaign alert dispatch failed");
    }

    match blocker::block_source(
        &state.db,
        &state.ipset,
        cfg,
        &campaign.source_ip,
        crate::models::block::BlockReason::Automatic,
        None,
    )
    .await
    {
        Ok(BlockOutcome::Applied(block)) => {
            summary.blocks_applied += 1;
            let occurrence = Occurrence::BlockApplied {
                source_ip: block.source_ip.clone(),
                expires_at: block.expires_at,
            };
            if let Err(e) = dispatcher::dispatch(&state.db, &state.http, cfg, &occurrence).await
            {
                tracing::error!(tenant = %cfg.tenant_id, error = %e, "Block alert dispatch failed");
            }
        }
        Ok(BlockOutcome::AlreadyBlocked(block)) => {
            // A fresh campaign re-qualified while the block is still live:
            // restart the automatic TTL. Mere repeat events never reach
            // here; only a qualifying edge does.
            match blocker::refresh_ttl(&state.db, &cfg.tenant_id, &block.source_ip, cfg.block_ttl())
                .await
            {
                Ok(Some(refreshed)) => {
                    tracing::info!(
                        tenant = %cfg.tenant_id,
                        source_ip = %refreshed.source_ip,
                        expires_at = ?refreshed.expires_at,
                        "Re-qualified campaign refreshed block TTL"
                    );
                }
                // Pending or manual blocks keep their own expiry.
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        tenant = %cfg.tenant_id,
                        source_ip = %block.source_ip,
                        error = %e,
                        "Block TTL refresh failed"
                    );
                }
            }
        }
        Ok(BlockOutcome::Pending(block)) => {
            summary.blocks_pending += 1;
            let occurrence = Occurrence::BlockFailed {
                source_ip: block.source_ip.clone(),
                error: block
                    .last_error
                    .unwrap_or_else(|| "external mutation failed".to_string()),
            };
            if let Err(e) = dispatcher::dispatch(&state.db, &state.http, cfg, &occurrence).await
            {
                tracing::error!(tenant = %cfg.tenant_id, error = %e, "Block-failure dispatch failed");
            }
        }
        Err(e) => {
            tracing::error!(
                tenant = %cfg.tenant_id,
                source_ip = %campaign.source_ip,
                error = %e,
                "Auto-block failed"
            );
        }
    }
}
