//! Delivery envelope decoding.
//!
//! The log-streaming subscription delivers gzip-compressed payloads. The
//! decompressed body is one of: a subscription envelope (`{"records": [...]}`),
//! a bare JSON array of records, or newline-delimited JSON. Direct
//! (uncompressed) posts of the same shapes are accepted for testing and
//! replay tooling.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;

use crate::errors::AppError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode a delivery payload into raw JSON records, preserving delivery order.
///
/// Only the envelope itself is validated here; individual records are opaque
/// values handed to the record parser, so one bad record cannot fail the
/// envelope.
pub fn decode(payload: &[u8]) -> Result<Vec<Value>, AppError> {
    let body = if payload.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| AppError::Validation(format!("Failed to decompress payload: {e}")))?;
        out
    } else {
        payload.to_vec()
    };

    let text = std::str::from_utf8(&body)
        .map_err(|e| AppError::Validation(format!("Payload is not valid UTF-8: {e}")))?;

    // Envelope object or bare array first, NDJSON as fallback.
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        match value {
            Value::Object(mut obj) => match obj.remove("records") {
                Some(Value::Array(records)) => return Ok(records),
                Some(_) => {
                    return Err(AppError::Validation(
                        "Envelope field 'records' is not an array".to_string(),
                    ))
                }
                // A single bare record object.
                None => return Ok(vec![Value::Object(obj)]),
            },
            Value::Array(records) => return Ok(records),
            _ => {
                return Err(AppError::Validation(
                    "Payload is neither an envelope, an array, nor NDJSON".to_string(),
                ))
            }
        }
    }

    let mut records = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str::<Value>(line)
            .map_err(|e| AppError::Validation(format!("Invalid NDJSON line: {e}")))?;
        records.push(value);
    }

    if records.is_empty() {
        return Err(AppError::Validation("Empty delivery payload".to_string()));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decodes_envelope_object() {
        let payload = br#"{"records": [{"a": 1}, {"b": 2}]}"#;
        let records = decode(payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["a"], 1);
    }

    #[test]
    fn decodes_bare_array() {
        let payload = br#"[{"a": 1}]"#;
        let records = decode(payload).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn decodes_single_record_object() {
        let payload = br#"{"action": "BLOCK"}"#;
        let records = decode(payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["action"], "BLOCK");
    }

    #[test]
    fn decodes_ndjson() {
        let payload = b"{\"a\": 1}x"; // force JSON failure

        // A full-payload JSON parse fails here, so exercise the NDJSON path
        // with a genuinely line-delimited body instead.
        assert!(decode(payload).is_err());

        let ndjson = b"{\"a\": 1}\n{\"b\": 2}\n";
        // Leading '{' makes serde parse only as a failed single value, falling
        // through to line-by-line parsing.
        let records = decode(ndjson).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn decodes_gzip_compressed_envelope() {
        let compressed = gzip(br#"{"records": [{"a": 1}, {"b": 2}, {"c": 3}]}"#);
        let records = decode(&compressed).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn preserves_delivery_order() {
        let payload = br#"{"records": [{"seq": 0}, {"seq": 1}, {"seq": 2}]}"#;
        let records = decode(payload).unwrap();
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record["seq"], i);
        }
    }

    #[test]
    fn rejects_empty_payload() {
        assert!(decode(b"").is_err());
        assert!(decode(b"   \n  ").is_err());
    }

    #[test]
    fn rejects_non_array_records_field() {
        let payload = br#"{"records": "nope"}"#;
        assert!(decode(payload).is_err());
    }

    #[test]
    fn rejects_corrupt_gzip() {
        let mut compressed = gzip(br#"{"records": []}"#);
        compressed.truncate(6);
        assert!(decode(&compressed).is_err());
    }
}
