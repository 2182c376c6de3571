//! Stateless threat classification of normalized firewall events.
//!
//! Signature matching runs per category in a fixed order; the first category
//! with a matching signature wins. When the firewall itself already blocked
//! the request and its terminating rule id corroborates the matched category,
//! severity is escalated by one level.
//!
//! Classification is total and deterministic: identical input always yields
//! identical output, and unmatched events classify as (none, none).

use regex::Regex;

use crate::models::event::{FirewallAction, NewEvent, SeverityLevel, ThreatCategory};

/// Outcome of classifying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Option<ThreatCategory>,
    pub severity: SeverityLevel,
}

impl Classification {
    pub const NONE: Self = Self {
        category: None,
        severity: SeverityLevel::None,
    };
}

/// One signature rule: a set of target patterns for a category plus a
/// firewall rule-id hint used for corroborated escalation.
struct Signature {
    category: ThreatCategory,
    base_severity: SeverityLevel,
    uri_patterns: Vec<Regex>,
    agent_patterns: Vec<Regex>,
    rule_hint: Regex,
}

impl Signature {
    fn matches(&self, target: &str, user_agent: Option<&str>) -> bool {
        if self.uri_patterns.iter().any(|re| re.is_match(target)) {
            return true;
        }
        match user_agent {
            Some(agent) => self.agent_patterns.iter().any(|re| re.is_match(agent)),
            None => false,
        }
    }
}

/// Compiled signature table. Build once and reuse across a batch; `classify`
/// is pure and takes `&self`.
pub struct ThreatDetector {
    signatures: Vec<Signature>,
}

impl Default for ThreatDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreatDetector {
    pub fn new() -> Self {
        Self {
            signatures: builtin_signatures(),
        }
    }

    /// Classify one normalized event. First matching category wins; the
    /// match target is the percent-decoded, lowercased URI plus query.
    pub fn classify(&self, event: &NewEvent) -> Classification {
        let target = normalize_target(&event.uri);
        let agent = event.user_agent.as_deref().map(str::to_lowercase);

        for signature in &self.signatures {
            if !signature.matches(&target, agent.as_deref()) {
                continue;
            }

            let mut severity = signature.base_severity;
            if event.action == FirewallAction::Block && self.rule_corroborates(signature, event) {
                severity = severity.escalated();
            }
            return Classification {
                category: Some(signature.category),
                severity,
            };
        }

        Classification::NONE
    }

    /// The firewall's own terminating rule fired for the same category.
    fn rule_corroborates(&self, signature: &Signature, event: &NewEvent) -> bool {
        event
            .rule_id
            .as_deref()
            .is_some_and(|rule| signature.rule_hint.is_match(rule))
    }
}

/// Percent-decode and lowercase a URI for signature matching. Invalid
/// escapes are kept verbatim; `+` decodes to a space.
fn normalize_target(uri: &str) -> String {
    let bytes = uri.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_lowercase()
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("builtin signature pattern must compile"))
        .collect()
}

/// The ordered builtin signature table. Categories earlier in the list take
/// precedence when multiple would match.
fn builtin_signatures() -> Vec<Signature> {
    vec![
        Signature {
            category: ThreatCategory::SqlInjection,
            base_severity: SeverityLevel::High,
            uri_patterns: compile(&[
                r"union\s+(all\s+)?select",
                r"'\s*(or|and)\s*'?\d+'?\s*=\s*'?\d+",
                r"\b(sleep|benchmark|pg_sleep)\s*\(",
                r"information_schema",
                r"drop\s+table",
                r";\s*--",
            ]),
            agent_patterns: Vec::new(),
            rule_hint: Regex::new(r"(?i)sqli?").expect("rule hint must compile"),
        },
        Signature {
            category: ThreatCategory::CrossSiteScripting,
            base_severity: SeverityLevel::High,
            uri_patterns: compile(&[
                r"<script",
                r"javascript:",
                r"\bon(error|load|mouseover)\s*=",
                r"document\.cookie",
                r"alert\s*\(",
            ]),
            agent_patterns: Vec::new(),
            rule_hint: Regex::new(r"(?i)xss|cross.?site").expect("rule hint must compile"),
        },
        Signature {
            category: ThreatCategory::PathTraversal,
            base_severity: SeverityLevel::Medium,
            uri_patterns: compile(&[
                r"\.\./",
                r"\.\.\\",
                r"/etc/(passwd|shadow)",
                r"c:\\windows",
                r"/proc/self",
            ]),
            agent_patterns: Vec::new(),
            rule_hint: Regex::new(r"(?i)lfi|traversal|path").expect("rule hint must compile"),
        },
        Signature {
            category: ThreatCategory::CommandInjection,
            base_severity: SeverityLevel::High,
            uri_patterns: compile(&[
                r";\s*(cat|ls|id|whoami|wget|curl|rm)\b",
                r"\|\s*(cat|nc|bash|sh)\b",
                r"\$\(",
                r"`[^`]+`",
                r"&&\s*(cat|wget|curl|rm)\b",
            ]),
            agent_patterns: Vec::new(),
            rule_hint: Regex::new(r"(?i)rce|command|cmd").expect("rule hint must compile"),
        },
        Signature {
            category: ThreatCategory::ScannerBot,
            base_severity: SeverityLevel::Low,
            uri_patterns: Vec::new(),
            agent_patterns: compile(&[
                r"sqlmap|nikto|nessus|masscan|nmap|zgrab|dirbuster|gobuster|wpscan|acunetix",
                r"^python-requests|^go-http-client|^libwww",
            ]),
            rule_hint: Regex::new(r"(?i)bot|scanner|reputation").expect("rule hint must compile"),
        },
        Signature {
            category: ThreatCategory::ApiDiscoveryProbe,
            base_severity: SeverityLevel::Low,
            uri_patterns: compile(&[
                r"^/\.env\b",
                r"^/\.git(/|\b)",
                r"/wp-(login|admin|config)",
                r"/phpmyadmin",
                r"/(swagger|api-docs|openapi\.json)",
                r"/actuator(/|\b)",
                r"/server-status",
                r"\.aws/credentials",
            ]),
            agent_patterns: Vec::new(),
            rule_hint: Regex::new(r"(?i)probe|discovery|anonymous").expect("rule hint must compile"),
        },
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    /// Build a test event with the given attack surface.
    pub(crate) fn make_event(
        uri: &str,
        action: FirewallAction,
        rule_id: Option<&str>,
    ) -> NewEvent {
        NewEvent {
            occurred_at: Utc::now(),
            source_ip: "203.0.113.9".to_string(),
            uri: uri.to_string(),
            http_method: "GET".to_string(),
            rule_id: rule_id.map(str::to_string),
            action,
            user_agent: Some("Mozilla/5.0".to_string()),
            raw_ref: None,
            region: Some("us-east-1".to_string()),
        }
    }

    #[test]
    fn classifies_sql_injection() {
        let detector = ThreatDetector::new();
        let event = make_event("/item?id=1' OR '1'='1", FirewallAction::Allow, None);
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::SqlInjection));
        assert_eq!(c.severity, SeverityLevel::High);
    }

    #[test]
    fn classifies_percent_encoded_sql_injection() {
        let detector = ThreatDetector::new();
        let event = make_event(
            "/search?q=%27%20OR%20%271%27%3D%271",
            FirewallAction::Allow,
            None,
        );
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::SqlInjection));
    }

    #[test]
    fn classifies_cross_site_scripting() {
        let detector = ThreatDetector::new();
        let event = make_event(
            "/comment?text=<script>alert(1)</script>",
            FirewallAction::Allow,
            None,
        );
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::CrossSiteScripting));
        assert_eq!(c.severity, SeverityLevel::High);
    }

    #[test]
    fn classifies_path_traversal() {
        let detector = ThreatDetector::new();
        let event = make_event("/static?file=../../etc/passwd", FirewallAction::Allow, None);
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::PathTraversal));
        assert_eq!(c.severity, SeverityLevel::Medium);
    }

    #[test]
    fn classifies_command_injection() {
        let detector = ThreatDetector::new();
        let event = make_event("/ping?host=1.1.1.1;cat /etc/hosts", FirewallAction::Allow, None);
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::CommandInjection));
    }

    #[test]
    fn classifies_scanner_by_user_agent() {
        let detector = ThreatDetector::new();
        let mut event = make_event("/", FirewallAction::Count, None);
        event.user_agent = Some("sqlmap/1.7.2#stable".to_string());
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::ScannerBot));
        assert_eq!(c.severity, SeverityLevel::Low);
    }

    #[test]
    fn classifies_api_discovery_probe() {
        let detector = ThreatDetector::new();
        let event = make_event("/.env", FirewallAction::Block, None);
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::ApiDiscoveryProbe));
    }

    #[test]
    fn benign_event_classifies_none() {
        let detector = ThreatDetector::new();
        let event = make_event("/products?page=2", FirewallAction::Allow, None);
        assert_eq!(detector.classify(&event), Classification::NONE);
    }

    #[test]
    fn corroborated_block_escalates_one_level() {
        let detector = ThreatDetector::new();
        let event = make_event(
            "/item?id=1' OR '1'='1",
            FirewallAction::Block,
            Some("AWSManagedRulesSQLiRuleSet"),
        );
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::SqlInjection));
        assert_eq!(c.severity, SeverityLevel::Critical);
    }

    #[test]
    fn block_without_matching_rule_id_does_not_escalate() {
        let detector = ThreatDetector::new();
        let event = make_event(
            "/item?id=1' OR '1'='1",
            FirewallAction::Block,
            Some("RateLimitRule"),
        );
        let c = detector.classify(&event);
        assert_eq!(c.severity, SeverityLevel::High);
    }

    #[test]
    fn matching_rule_id_without_block_does_not_escalate() {
        let detector = ThreatDetector::new();
        let event = make_event(
            "/item?id=1' OR '1'='1",
            FirewallAction::Count,
            Some("AWSManagedRulesSQLiRuleSet"),
        );
        let c = detector.classify(&event);
        assert_eq!(c.severity, SeverityLevel::High);
    }

    #[test]
    fn first_matching_category_wins() {
        // URI matching both SQLi and XSS patterns classifies as SQLi
        // because it comes first in the table.
        let detector = ThreatDetector::new();
        let event = make_event(
            "/q?x=union select <script>",
            FirewallAction::Allow,
            None,
        );
        let c = detector.classify(&event);
        assert_eq!(c.category, Some(ThreatCategory::SqlInjection));
    }

    #[test]
    fn classification_is_deterministic() {
        let detector = ThreatDetector::new();
        let event = make_event("/a?b=../..//etc/passwd", FirewallAction::Block, Some("LFI_Rule"));
        let first = detector.classify(&event);
        for _ in 0..10 {
            assert_eq!(detector.classify(&event), first);
        }
    }

    #[test]
    fn normalize_decodes_percent_and_plus() {
        assert_eq!(normalize_target("/a%27b+c"), "/a'b c");
        assert_eq!(normalize_target("/A%2E%2E/"), "/a../");
    }

    #[test]
    fn normalize_keeps_invalid_escapes() {
        assert_eq!(normalize_target("/a%zz"), "/a%zz");
        assert_eq!(normalize_target("/a%2"), "/a%2");
    }
}
