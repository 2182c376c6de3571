//! Firewall log record parser.
//!
//! Maps the firewall's log schema onto the normalized `NewEvent` model.
//! Decoding is defensive: required fields (timestamp, client IP, action)
//! fail the record with a `RecordError`; fields introduced by newer schema
//! versions default to `None` so older log formats keep parsing.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::models::event::{FirewallAction, NewEvent};
use crate::parsers::{BatchParse, RecordError};

/// Raw firewall log record as delivered.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    /// Epoch milliseconds.
    timestamp: Option<i64>,
    action: Option<String>,
    terminating_rule_id: Option<String>,
    web_acl_id: Option<String>,
    http_request: Option<RawHttpRequest>,
    // Absent before schema v2.
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHttpRequest {
    client_ip: Option<String>,
    uri: Option<String>,
    args: Option<String>,
    http_method: Option<String>,
    #[serde(default)]
    headers: Vec<RawHeader>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

/// Rule ids the firewall emits when no named rule terminated the request.
const UNNAMED_RULES: [&str; 2] = ["Default_Action", ""];

/// Normalize a batch of raw records in delivery order.
pub fn parse_batch(records: &[Value]) -> BatchParse {
    let mut batch = BatchParse::default();
    for (i, record) in records.iter().enumerate() {
        match parse_record(record, i) {
            Ok(event) => batch.events.push(event),
            Err(err) => batch.errors.push(err),
        }
    }
    batch
}

fn parse_record(record: &Value, index: usize) -> Result<NewEvent, RecordError> {
    let raw: RawRecord = serde_json::from_value(record.clone()).map_err(|e| RecordError {
        record_index: index,
        field: "record".to_string(),
        message: format!("Malformed record: {e}"),
    })?;

    let occurred_at = parse_timestamp(raw.timestamp, index)?;
    let action = parse_action(raw.action.as_deref(), index)?;

    let request = raw.http_request.ok_or_else(|| RecordError {
        record_index: index,
        field: "httpRequest".to_string(),
        message: "Missing httpRequest".to_string(),
    })?;

    let source_ip = request
        .client_ip
        .as_deref()
        .and_then(|ip| ip.parse::<std::net::IpAddr>().ok())
        .ok_or_else(|| RecordError {
            record_index: index,
            field: "httpRequest.clientIp".to_string(),
            message: format!("Missing or invalid client IP: {:?}", request.client_ip),
        })?
        .to_string();

    let mut uri = request.uri.unwrap_or_else(|| "/".to_string());
    if let Some(args) = request.args.filter(|a| !a.is_empty()) {
        uri = format!("{uri}?{args}");
    }

    let rule_id = raw
        .terminating_rule_id
        .filter(|r| !UNNAMED_RULES.contains(&r.as_str()));

    let user_agent = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("user-agent"))
        .map(|h| h.value.clone());

    let raw_ref = raw
        .web_acl_id
        .map(|acl| format!("{acl}:{}", occurred_at.timestamp_millis()));

    Ok(NewEvent {
        occurred_at,
        source_ip,
        uri,
        http_method: request.http_method.unwrap_or_else(|| "GET".to_string()),
        rule_id,
        action,
        user_agent,
        raw_ref,
        region: raw.region,
    })
}

fn parse_timestamp(millis: Option<i64>, index: usize) -> Result<DateTime<Utc>, RecordError> {
    let millis = millis.ok_or_else(|| RecordError {
        record_index: index,
        field: "timestamp".to_string(),
        message: "Missing timestamp".to_string(),
    })?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RecordError {
            record_index: index,
            field: "timestamp".to_string(),
            message: format!("Timestamp out of range: {millis}"),
        })
}

fn parse_action(action: Option<&str>, index: usize) -> Result<FirewallAction, RecordError> {
    match action.map(|a| a.to_uppercase()).as_deref() {
        Some("ALLOW") => Ok(FirewallAction::Allow),
        Some("BLOCK") => Ok(FirewallAction::Block),
        Some("COUNT") => Ok(FirewallAction::Count),
        other => Err(RecordError {
            record_index: index,
            field: "action".to_string(),
            message: format!("Unknown firewall action: {other:?}"),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Build a well-formed raw record for tests across the crate.
    pub(crate) fn sample_record(ip: &str, uri: &str, action: &str, rule_id: &str) -> Value {
        json!({
            "timestamp": 1_700_000_000_000i64,
            "formatVersion": 1,
            "webAclId": "acl-1234",
            "terminatingRuleId": rule_id,
            "action": action,
            "region": "us-east-1",
            "httpRequest": {
                "clientIp": ip,
                "country": "US",
                "uri": uri,
                "args": "",
                "httpMethod": "GET",
                "headers": [
                    {"name": "User-Agent", "value": "Mozilla/5.0"},
                    {"name": "Host", "value": "app.example.com"}
                ]
            }
        })
    }

    #[test]
    fn parses_well_formed_record() {
        let record = sample_record("203.0.113.9", "/login", "BLOCK", "SQLi_Body");
        let batch = parse_batch(&[record]);
        assert!(batch.errors.is_empty());
        assert_eq!(batch.events.len(), 1);

        let event = &batch.events[0];
        assert_eq!(event.source_ip, "203.0.113.9");
        assert_eq!(event.uri, "/login");
        assert_eq!(event.action, FirewallAction::Block);
        assert_eq!(event.rule_id.as_deref(), Some("SQLi_Body"));
        assert_eq!(event.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(event.region.as_deref(), Some("us-east-1"));
        assert!(event.raw_ref.as_deref().unwrap().starts_with("acl-1234:"));
    }

    #[test]
    fn args_appended_to_uri() {
        let mut record = sample_record("203.0.113.9", "/search", "ALLOW", "");
        record["httpRequest"]["args"] = json!("q=1%27%20OR%20%271%27%3D%271");
        let batch = parse_batch(&[record]);
        assert_eq!(batch.events[0].uri, "/search?q=1%27%20OR%20%271%27%3D%271");
    }

    #[test]
    fn default_action_rule_id_normalized_to_none() {
        let record = sample_record("203.0.113.9", "/", "ALLOW", "Default_Action");
        let batch = parse_batch(&[record]);
        assert!(batch.events[0].rule_id.is_none());
    }

    #[test]
    fn malformed_record_isolated_from_batch() {
        let good = sample_record("203.0.113.9", "/a", "BLOCK", "r1");
        let bad = json!({"timestamp": "not-a-number"});
        let also_good = sample_record("198.51.100.7", "/b", "ALLOW", "");

        let batch = parse_batch(&[good, bad, also_good]);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].record_index, 1);
    }

    #[test]
    fn missing_timestamp_fails_record() {
        let mut record = sample_record("203.0.113.9", "/", "BLOCK", "r1");
        record.as_object_mut().unwrap().remove("timestamp");
        let batch = parse_batch(&[record]);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].field, "timestamp");
    }

    #[test]
    fn invalid_client_ip_fails_record() {
        let mut record = sample_record("not-an-ip", "/", "BLOCK", "r1");
        record["httpRequest"]["clientIp"] = json!("999.999.0.1");
        let batch = parse_batch(&[record]);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].field, "httpRequest.clientIp");
    }

    #[test]
    fn unknown_action_fails_record() {
        let record = sample_record("203.0.113.9", "/", "CAPTCHA", "r1");
        let batch = parse_batch(&[record]);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].field, "action");
    }

    #[test]
    fn older_schema_fields_default_to_none() {
        let mut record = sample_record("203.0.113.9", "/", "ALLOW", "");
        let obj = record.as_object_mut().unwrap();
        obj.remove("region");
        obj.remove("webAclId");
        let batch = parse_batch(&[record]);
        assert!(batch.errors.is_empty());

        let event = &batch.events[0];
        assert!(event.region.is_none());
        assert!(event.raw_ref.is_none());
    }

    #[test]
    fn ipv6_client_ip_accepted() {
        let mut record = sample_record("203.0.113.9", "/", "BLOCK", "r1");
        record["httpRequest"]["clientIp"] = json!("2001:db8::42");
        let batch = parse_batch(&[record]);
        assert!(batch.errors.is_empty());
        assert_eq!(batch.events[0].source_ip, "2001:db8::42");
    }
}
