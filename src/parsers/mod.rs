//! Log delivery decoding and firewall record normalization.
//!
//! `envelope` unwraps the compressed delivery payload into raw JSON records;
//! `waf_log` normalizes each record into a `NewEvent`. Both are pure
//! transforms: a malformed record fails independently and is reported,
//! never aborting the batch, and nothing here touches the database.

pub mod envelope;
pub mod waf_log;

use crate::models::event::NewEvent;

/// Result of parsing one delivery batch.
#[derive(Debug, Default)]
pub struct BatchParse {
    /// Normalized events in delivery order.
    pub events: Vec<NewEvent>,
    /// One entry per malformed record.
    pub errors: Vec<RecordError>,
}

/// Error encountered while normalizing an individual record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordError {
    pub record_index: usize,
    pub field: String,
    pub message: String,
}
