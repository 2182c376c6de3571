//! Alert dispatch evidence and the in-application notification store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::event::SeverityLevel;

/// Notification channels the dispatcher fans out to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "alert_channel", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Topic,
    Webhook,
    InApp,
}

impl std::fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topic => write!(f, "topic"),
            Self::Webhook => write!(f, "webhook"),
            Self::InApp => write!(f, "in_app"),
        }
    }
}

/// Evidence that a notification was dispatched for a subject key on a
/// channel, used to suppress repeats within the suppression window.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AlertRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub subject_key: String,
    pub channel: AlertChannel,
    pub dispatched_at: DateTime<Utc>,
    pub suppressed_until: DateTime<Utc>,
    pub suppressed_count: i32,
}

/// A row in the in-application notification store, read by the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: String,
    pub subject_key: String,
    pub severity: SeverityLevel,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_channel_serialization() {
        assert_eq!(
            serde_json::to_string(&AlertChannel::InApp).unwrap(),
            "\"in_app\""
        );
        assert_eq!(
            serde_json::to_string(&AlertChannel::Topic).unwrap(),
            "\"topic\""
        );
    }

    #[test]
    fn alert_channel_display_matches_serde() {
        for channel in [AlertChannel::Topic, AlertChannel::Webhook, AlertChannel::InApp] {
            let json = serde_json::to_string(&channel).unwrap();
            assert_eq!(json, format!("\"{channel}\""));
        }
    }
}
