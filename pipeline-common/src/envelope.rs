use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current version stamped on envelopes this workspace publishes.
pub const ENVELOPE_VERSION: &str = "1.0";

/// The outer wrapper around every message on the bus.
///
/// `data` stays an untyped JSON value here on purpose: the envelope crosses
/// the wire before schema validation has run, and the typed payload is only
/// decoded afterwards (see `events::EventPayload::from_envelope`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub version: String,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a payload for publishing. A fresh `event_id` per publish attempt.
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.to_owned(),
            timestamp: OffsetDateTime::now_utc(),
            version: ENVELOPE_VERSION.to_owned(),
            data,
        }
    }

    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.to_string())
    }
}
