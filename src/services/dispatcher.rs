//! Multi-channel alert fan-out with per-subject de-duplication.
//!
//! Every significant occurrence resolves to a stable subject key; the
//! alert_records table arbitrates, per channel, whether a notification goes
//! out or is counted as suppressed. The claim is a conditional write, so
//! concurrent dispatchers for the same subject cannot both send. A failure
//! on one channel never prevents the others and is never retried
//! synchronously; the next occurrence re-attempts naturally.

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::alert::AlertChannel;
use crate::models::event::{SeverityLevel, ThreatCategory};
use crate::models::tenant::TenantConfig;

/// A significant occurrence worth notifying operators about.
#[derive(Debug, Clone)]
pub enum Occurrence {
    CampaignQualified {
        campaign_id: Uuid,
        source_ip: String,
        severity: SeverityLevel,
        event_count: i32,
    },
    BlockApplied {
        source_ip: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    BlockFailed {
        source_ip: String,
        error: String,
    },
    CriticalEvent {
        event_id: Uuid,
        source_ip: String,
        category: ThreatCategory,
    },
    /// Periodic digest of medium/low activity, produced by the re-analyzer.
    Digest {
        summary: String,
        event_count: i64,
    },
}

impl Occurrence {
    /// Stable de-duplication key. Keyed by source identity rather than by
    /// campaign/event id, so a follow-up occurrence for the same source
    /// within the suppression window is deduplicated.
    pub fn subject_key(&self, tenant_id: &str) -> String {
        let raw = match self {
            Self::CampaignQualified { source_ip, .. } => {
                format!("campaign:{tenant_id}:{source_ip}")
            }
            Self::BlockApplied { source_ip, .. } | Self::BlockFailed { source_ip, .. } => {
                format!("block:{tenant_id}:{source_ip}")
            }
            Self::CriticalEvent {
                source_ip, category, ..
            } => format!("event:{tenant_id}:{source_ip}:{category}"),
            Self::Digest { .. } => return Self::digest_subject(tenant_id),
        };
        hash_subject(&raw)
    }

    /// Subject key shared by every digest occurrence for a tenant; also used
    /// to look up when the previous digest went out.
    pub fn digest_subject(tenant_id: &str) -> String {
        hash_subject(&format!("digest:{tenant_id}"))
    }

    pub fn severity(&self) -> SeverityLevel {
        match self {
            Self::CampaignQualified { severity, .. } => *severity,
            Self::BlockApplied { .. } | Self::BlockFailed { .. } => SeverityLevel::High,
            Self::CriticalEvent { .. } => SeverityLevel::Critical,
            Self::Digest { .. } => SeverityLevel::Low,
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::CampaignQualified {
                source_ip,
                event_count,
                ..
            } => format!("Attack campaign from {source_ip} ({event_count} events)"),
            Self::BlockApplied { source_ip, .. } => format!("Source {source_ip} blocked"),
            Self::BlockFailed { source_ip, .. } => {
                format!("Failed to block source {source_ip}")
            }
            Self::CriticalEvent {
                source_ip,
                category,
                ..
            } => format!("Critical {category} request from {source_ip}"),
            Self::Digest { .. } => "Security activity digest".to_string(),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Self::CampaignQualified {
                campaign_id,
                source_ip,
                severity,
                event_count,
            } => format!(
                "Campaign {campaign_id}: {event_count} correlated events from {source_ip}, max severity {severity}."
            ),
            Self::BlockApplied {
                source_ip,
                expires_at,
            } => match expires_at {
                Some(exp) => format!("{source_ip} added to the blocklist until {exp}."),
                None => format!("{source_ip} added to the blocklist (no expiry)."),
            },
            Self::BlockFailed { source_ip, error } => format!(
                "Blocklist update for {source_ip} failed and is pending retry: {error}"
            ),
            Self::CriticalEvent {
                event_id,
                source_ip,
                category,
            } => format!(
                "Event {event_id}: critical-severity {category} request from {source_ip}."
            ),
            Self::Digest {
                summary,
                event_count,
            } => format!("{event_count} low/medium events since the last digest. {summary}"),
        }
    }
}

fn hash_subject(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Most recent successful dispatch for a subject, across channels. `None`
/// when the subject has never been dispatched.
pub async fn last_dispatch_time(
    pool: &PgPool,
    tenant_id: &str,
    subject_key: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, AppError> {
    let dispatched = sqlx::query_scalar(
        "SELECT MAX(dispatched_at) FROM alert_records WHERE tenant_id = $1 AND subject_key = $2",
    )
    .bind(tenant_id)
    .bind(subject_key)
    .fetch_one(pool)
    .await?;
    Ok(dispatched)
}

/// Outcome of one channel attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Dispatched,
    Suppressed,
    Failed,
    /// Channel not configured for this tenant.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub channel: AlertChannel,
    pub status: ChannelStatus,
}

/// Fan an occurrence out to every configured channel.
pub async fn dispatch(
    pool: &PgPool,
    http: &reqwest::Client,
    cfg: &TenantConfig,
    occurrence: &Occurrence,
) -> Result<Vec<ChannelOutcome>, AppError> {
    let subject_key = occurrence.subject_key(&cfg.tenant_id);
    let mut outcomes = Vec::new();

    for channel in [AlertChannel::Topic, AlertChannel::Webhook, AlertChannel::InApp] {
        let endpoint = match channel {
            AlertChannel::Topic => match &cfg.topic_url {
                Some(url) => Some(url.clone()),
                None => {
                    outcomes.push(ChannelOutcome {
                        channel,
                        status: ChannelStatus::Skipped,
                    });
                    continue;
                }
            },
            AlertChannel::Webhook => match &cfg.webhook_url {
                Some(url) => Some(url.clone()),
                None => {
                    outcomes.push(ChannelOutcome {
                        channel,
                        status: ChannelStatus::Skipped,
                    });
                    continue;
                }
            },
            AlertChannel::InApp => None,
        };

        if !claim(pool, cfg, &subject_key, channel).await? {
            count_suppressed(pool, cfg, &subject_key, channel).await?;
            tracing::debug!(
                tenant = %cfg.tenant_id,
                subject = %subject_key,
                %channel,
                "Alert suppressed within suppression window"
            );
            outcomes.push(ChannelOutcome {
                channel,
                status: ChannelStatus::Suppressed,
            });
            continue;
        }

        let result = match channel {
            AlertChannel::Topic => send_topic(http, endpoint.as_deref(), occurrence).await,
            AlertChannel::Webhook => send_webhook(http, endpoint.as_deref(), occurrence).await,
            AlertChannel::InApp => store_notification(pool, cfg, &subject_key, occurrence).await,
        };

        let status = match result {
            Ok(()) => {
                tracing::info!(
                    tenant = %cfg.tenant_id,
                    subject = %subject_key,
                    %channel,
                    severity = %occurrence.severity(),
                    "Alert dispatched"
                );
                ChannelStatus::Dispatched
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %cfg.tenant_id,
                    subject = %subject_key,
                    %channel,
                    error = %e,
                    "Channel delivery failed"
                );
                ChannelStatus::Failed
            }
        };
        outcomes.push(ChannelOutcome { channel, status });
    }

    Ok(outcomes)
}

/// Claim the right to dispatch for (subject, channel). Returns true for the
/// single winner inside the suppression window.
async fn claim(
    pool: &PgPool,
    cfg: &TenantConfig,
    subject_key: &str,
    channel: AlertChannel,
) -> Result<bool, AppError> {
    let until = chrono::Utc::now() + cfg.suppression();
    let claimed = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO alert_records (tenant_id, subject_key, channel, dispatched_at, suppressed_until)
        VALUES ($1, $2, $3, NOW(), $4)
        ON CONFLICT (tenant_id, subject_key, channel) DO UPDATE
            SET dispatched_at = NOW(), suppressed_until = $4, suppressed_count = 0
            WHERE alert_records.suppressed_until <= NOW()
        RETURNING id
        "#,
    )
    .bind(&cfg.tenant_id)
    .bind(subject_key)
    .bind(channel)
    .bind(until)
    .fetch_optional(pool)
    .await?;
    Ok(claimed.is_some())
}

async fn count_suppressed(
    pool: &PgPool,
    cfg: &TenantConfig,
    subject_key: &str,
    channel: AlertChannel,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE alert_records SET suppressed_count = suppressed_count + 1
        WHERE tenant_id = $1 AND subject_key = $2 AND channel = $3
        "#,
    )
    .bind(&cfg.tenant_id)
    .bind(subject_key)
    .bind(channel)
    .execute(pool)
    .await?;
    Ok(())
}

/// Publish to the operational pub/sub topic.
async fn send_topic(
    http: &reqwest::Client,
    endpoint: Option<&str>,
    occurrence: &Occurrence,
) -> Result<(), AppError> {
    let url = endpoint
        .ok_or_else(|| AppError::ChannelFailure("Topic endpoint missing".to_string()))?;
    let payload = json!({
        "subject": occurrence.title(),
        "message": occurrence.body(),
        "severity": occurrence.severity(),
    });
    post_json(http, url, &payload).await
}

/// Post a formatted message to the chat webhook.
async fn send_webhook(
    http: &reqwest::Client,
    endpoint: Option<&str>,
    occurrence: &Occurrence,
) -> Result<(), AppError> {
    let url = endpoint
        .ok_or_else(|| AppError::ChannelFailure("Webhook endpoint missing".to_string()))?;
    let icon = match occurrence.severity() {
        SeverityLevel::Critical => ":rotating_light:",
        SeverityLevel::High => ":warning:",
        _ => ":information_source:",
    };
    let payload = json!({
        "text": format!("{icon} *{}*\n{}", occurrence.title(), occurrence.body()),
    });
    post_json(http, url, &payload).await
}

async fn post_json(
    http: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(), AppError> {
    let response = http
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| AppError::ChannelFailure(format!("Delivery failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::ChannelFailure(format!(
            "Channel endpoint returned {}",
            response.status()
        )));
    }
    Ok(())
}

/// Write to the in-application notification store read by the dashboard.
async fn store_notification(
    pool: &PgPool,
    cfg: &TenantConfig,
    subject_key: &str,
    occurrence: &Occurrence,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO notifications (tenant_id, subject_key, severity, title, body)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&cfg.tenant_id)
    .bind(subject_key)
    .bind(occurrence.severity())
    .bind(occurrence.title())
    .bind(occurrence.body())
    .execute(pool)
    .await?;
    Ok(())
}
