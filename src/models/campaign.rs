//! Attack campaign model: a correlated cluster of events from one source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::event::SeverityLevel;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "campaign_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Resolved,
}

/// A persisted campaign row. Exactly one active row per (tenant, source_ip)
/// exists at any time, enforced by a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AttackCampaign {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_ip: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: i32,
    pub max_severity: SeverityLevel,
    pub status: CampaignStatus,
    /// Set once, by whichever path wins the conditional update. The
    /// qualifying transition fires exactly once per campaign lifetime.
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AttackCampaign {
    pub fn is_escalated(&self) -> bool {
        self.escalated_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_serialization() {
        let json = serde_json::to_string(&CampaignStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        let json = serde_json::to_string(&CampaignStatus::Resolved).unwrap();
        assert_eq!(json, "\"resolved\"");
    }

    #[test]
    fn is_escalated_reflects_marker() {
        let mut campaign = AttackCampaign {
            id: Uuid::nil(),
            tenant_id: "t1".to_string(),
            source_ip: "203.0.113.9".to_string(),
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
            event_count: 1,
            max_severity: SeverityLevel::High,
            status: CampaignStatus::Active,
            escalated_at: None,
            created_at: Utc::now(),
        };
        assert!(!campaign.is_escalated());
        campaign.escalated_at = Some(Utc::now());
        assert!(campaign.is_escalated());
    }
}
