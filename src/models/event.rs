//! Firewall event model with enums shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// -- Enums matching PostgreSQL --

/// The decision the firewall itself took on the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "firewall_action", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallAction {
    Allow,
    Block,
    Count,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "threat_category", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ThreatCategory {
    SqlInjection,
    CrossSiteScripting,
    PathTraversal,
    CommandInjection,
    ScannerBot,
    ApiDiscoveryProbe,
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SqlInjection => "sql-injection",
            Self::CrossSiteScripting => "cross-site-scripting",
            Self::PathTraversal => "path-traversal",
            Self::CommandInjection => "command-injection",
            Self::ScannerBot => "scanner-bot",
            Self::ApiDiscoveryProbe => "api-discovery-probe",
        };
        write!(f, "{s}")
    }
}

/// Severity levels ordered from least to most severe so that `Ord`
/// comparisons match escalation semantics.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, PartialOrd, Ord,
)]
#[sqlx(type_name = "severity_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    /// One level up, capped at Critical. `None` never escalates.
    pub fn escalated(self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High => Self::Critical,
            Self::Critical => Self::Critical,
        }
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

// -- Core Event --

/// A persisted firewall decision record. Immutable after insert;
/// classification columns are set exactly once, at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source_ip: String,
    pub uri: String,
    pub http_method: String,
    pub rule_id: Option<String>,
    pub action: FirewallAction,
    pub category: Option<ThreatCategory>,
    pub severity: SeverityLevel,
    pub raw_ref: Option<String>,
    pub region: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A normalized log record produced by the parser, not yet classified
/// or persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub occurred_at: DateTime<Utc>,
    pub source_ip: String,
    pub uri: String,
    pub http_method: String,
    pub rule_id: Option<String>,
    pub action: FirewallAction,
    pub user_agent: Option<String>,
    pub raw_ref: Option<String>,
    pub region: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_category_serialization() {
        let cat = ThreatCategory::SqlInjection;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, "\"sql-injection\"");
    }

    #[test]
    fn threat_category_deserialization() {
        let cat: ThreatCategory = serde_json::from_str("\"api-discovery-probe\"").unwrap();
        assert_eq!(cat, ThreatCategory::ApiDiscoveryProbe);
    }

    #[test]
    fn firewall_action_serialization() {
        let action = FirewallAction::Block;
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(json, "\"BLOCK\"");
    }

    #[test]
    fn severity_ordering() {
        assert!(SeverityLevel::Critical > SeverityLevel::High);
        assert!(SeverityLevel::High > SeverityLevel::Medium);
        assert!(SeverityLevel::Medium > SeverityLevel::Low);
        assert!(SeverityLevel::Low > SeverityLevel::None);
    }

    #[test]
    fn severity_escalation_one_level() {
        assert_eq!(SeverityLevel::High.escalated(), SeverityLevel::Critical);
        assert_eq!(SeverityLevel::Medium.escalated(), SeverityLevel::High);
        assert_eq!(SeverityLevel::Low.escalated(), SeverityLevel::Medium);
    }

    #[test]
    fn severity_escalation_caps_at_critical() {
        assert_eq!(SeverityLevel::Critical.escalated(), SeverityLevel::Critical);
    }

    #[test]
    fn severity_none_never_escalates() {
        assert_eq!(SeverityLevel::None.escalated(), SeverityLevel::None);
    }

    #[test]
    fn category_display_matches_serde() {
        for cat in [
            ThreatCategory::SqlInjection,
            ThreatCategory::CrossSiteScripting,
            ThreatCategory::PathTraversal,
            ThreatCategory::CommandInjection,
            ThreatCategory::ScannerBot,
            ThreatCategory::ApiDiscoveryProbe,
        ] {
            let json = serde_json::to_string(&cat).unwrap();
            assert_eq!(json, format!("\"{cat}\""));
        }
    }
}
