//! Blocklist entry model tracking the external IP-set mutation lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "block_reason", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    Automatic,
    Manual,
}

/// Lifecycle: pending (external mutation not yet confirmed) → active →
/// expired/removed. A failed external mutation keeps the row pending for
/// a later retry by the sweeper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "block_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Active,
    Expired,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlockedSource {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_ip: String,
    pub reason: BlockReason,
    pub status: BlockStatus,
    pub created_at: DateTime<Utc>,
    /// Always set for automatic blocks (bounded TTL from created_at);
    /// optional for manual blocks.
    pub expires_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub last_error: Option<String>,
}

impl BlockedSource {
    /// Whether the entry's TTL has elapsed at `now`. Entries without an
    /// expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(expires_at: Option<DateTime<Utc>>) -> BlockedSource {
        BlockedSource {
            id: Uuid::nil(),
            tenant_id: "t1".to_string(),
            source_ip: "198.51.100.4".to_string(),
            reason: BlockReason::Automatic,
            status: BlockStatus::Active,
            created_at: Utc::now(),
            expires_at,
            external_ref: None,
            last_error: None,
        }
    }

    #[test]
    fn block_status_serialization() {
        let json = serde_json::to_string(&BlockStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn expired_when_past_expiry() {
        let now = Utc::now();
        let block = sample(Some(now - Duration::hours(1)));
        assert!(block.is_expired_at(now));
    }

    #[test]
    fn not_expired_before_expiry() {
        let now = Utc::now();
        let block = sample(Some(now + Duration::hours(1)));
        assert!(!block.is_expired_at(now));
    }

    #[test]
    fn manual_block_without_expiry_never_expires() {
        let block = sample(None);
        assert!(!block.is_expired_at(Utc::now() + Duration::days(3650)));
    }
}
