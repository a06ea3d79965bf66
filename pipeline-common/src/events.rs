//! Typed payloads for every event on the bus.
//!
//! The envelope's `event_type` string is the tag; after schema validation the
//! raw `data` value decodes into one of these structs. Payloads are manifests
//! of identifiers and counts, never full documents: the next stage fetches
//! its inputs from the store by ID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::envelope::EventEnvelope;
use crate::error::ProcessingError;

/// The pipeline stages that consume from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parsing,
    Chunking,
    Embedding,
    Summarization,
    Reporting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Summarization => "summarization",
            Stage::Reporting => "reporting",
        }
    }

    /// Routing key of the stage-specific failed queue.
    pub fn failed_routing_key(&self) -> String {
        format!("{}.failed", self.as_str())
    }

    /// The event type this stage consumes.
    pub fn consumed_event_type(&self) -> EventType {
        match self {
            Stage::Parsing => EventType::ArchiveIngested,
            Stage::Chunking => EventType::JsonParsed,
            Stage::Embedding => EventType::ChunksPrepared,
            Stage::Summarization => EventType::SummarizationRequested,
            Stage::Reporting => EventType::SummaryComplete,
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parsing" => Ok(Stage::Parsing),
            "chunking" => Ok(Stage::Chunking),
            "embedding" => Ok(Stage::Embedding),
            "summarization" => Ok(Stage::Summarization),
            "reporting" => Ok(Stage::Reporting),
            invalid => Err(format!("{} is not a pipeline stage", invalid)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Success event types, one per pipeline hop. The string form doubles as the
/// routing key on the bus and the schema name in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ArchiveIngested,
    JsonParsed,
    ChunksPrepared,
    SummarizationRequested,
    SummaryComplete,
    ReportPublished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ArchiveIngested => "archive.ingested",
            EventType::JsonParsed => "json.parsed",
            EventType::ChunksPrepared => "chunks.prepared",
            EventType::SummarizationRequested => "summarization.requested",
            EventType::SummaryComplete => "summary.complete",
            EventType::ReportPublished => "report.published",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveIngested {
    pub archive_id: String,
    pub source_name: String,
    pub file_path: String,
    pub file_hash_sha256: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonParsed {
    pub archive_id: String,
    pub message_ids: Vec<String>,
    pub message_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunksPrepared {
    pub archive_id: String,
    pub chunk_ids: Vec<String>,
    pub chunk_count: usize,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummarizationRequested {
    pub archive_id: String,
    pub thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryComplete {
    pub archive_id: String,
    pub summary_ids: Vec<String>,
    pub thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportPublished {
    pub report_ids: Vec<String>,
    pub thread_ids: Vec<String>,
}

/// The decoded payload of a validated envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ArchiveIngested(ArchiveIngested),
    JsonParsed(JsonParsed),
    ChunksPrepared(ChunksPrepared),
    SummarizationRequested(SummarizationRequested),
    SummaryComplete(SummaryComplete),
    ReportPublished(ReportPublished),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ArchiveIngested(_) => EventType::ArchiveIngested,
            EventPayload::JsonParsed(_) => EventType::JsonParsed,
            EventPayload::ChunksPrepared(_) => EventType::ChunksPrepared,
            EventPayload::SummarizationRequested(_) => EventType::SummarizationRequested,
            EventPayload::SummaryComplete(_) => EventType::SummaryComplete,
            EventPayload::ReportPublished(_) => EventType::ReportPublished,
        }
    }

    /// Decode the typed payload out of a schema-validated envelope. Call
    /// `SchemaRegistry::validate` first; this only handles the mapping from
    /// the `event_type` tag to the matching struct.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ProcessingError> {
        let data = envelope.data.clone();
        match envelope.event_type.as_str() {
            "archive.ingested" => Ok(EventPayload::ArchiveIngested(serde_json::from_value(data)?)),
            "json.parsed" => Ok(EventPayload::JsonParsed(serde_json::from_value(data)?)),
            "chunks.prepared" => Ok(EventPayload::ChunksPrepared(serde_json::from_value(data)?)),
            "summarization.requested" => Ok(EventPayload::SummarizationRequested(
                serde_json::from_value(data)?,
            )),
            "summary.complete" => {
                Ok(EventPayload::SummaryComplete(serde_json::from_value(data)?))
            }
            "report.published" => {
                Ok(EventPayload::ReportPublished(serde_json::from_value(data)?))
            }
            other => Err(ProcessingError::invalid_input(format!(
                "no payload type registered for event type {}",
                other
            ))),
        }
    }

    /// Wrap this payload into a fresh envelope for publishing.
    pub fn into_envelope(self) -> EventEnvelope {
        let event_type = self.event_type();
        let data = match self {
            EventPayload::ArchiveIngested(payload) => serde_json::to_value(payload),
            EventPayload::JsonParsed(payload) => serde_json::to_value(payload),
            EventPayload::ChunksPrepared(payload) => serde_json::to_value(payload),
            EventPayload::SummarizationRequested(payload) => serde_json::to_value(payload),
            EventPayload::SummaryComplete(payload) => serde_json::to_value(payload),
            EventPayload::ReportPublished(payload) => serde_json::to_value(payload),
        }
        .expect("event payloads serialize to plain JSON objects");
        EventEnvelope::new(event_type.as_str(), data)
    }
}

/// The failure context appended to a failed event's `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub error_message: String,
    pub error_type: String,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

impl FailureInfo {
    pub fn from_error(error: &ProcessingError, retry_count: u32) -> Self {
        Self {
            error_message: error.message.clone(),
            error_type: error.kind.as_str().to_owned(),
            retry_count,
            failed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Build the `<stage>.failed` envelope for a processing failure: the original
/// identifying fields, extended with the failure context. Carries enough for
/// an operator to triage and requeue without digging through logs.
pub fn failed_envelope(
    stage: Stage,
    original: &EventEnvelope,
    failure: &FailureInfo,
) -> EventEnvelope {
    let mut data = match original.data.clone() {
        serde_json::Value::Object(map) => map,
        other => {
            // Validated envelopes always carry an object; anything else is
            // wrapped so the failed record still round-trips
            let mut map = serde_json::Map::new();
            map.insert("original_data".to_owned(), other);
            map
        }
    };
    data.insert(
        "source_event_id".to_owned(),
        serde_json::Value::String(original.event_id.to_string()),
    );
    data.insert(
        "source_event_type".to_owned(),
        serde_json::Value::String(original.event_type.clone()),
    );

    let failure =
        serde_json::to_value(failure).expect("failure info serializes to a JSON object");
    if let serde_json::Value::Object(failure) = failure {
        data.extend(failure);
    }

    EventEnvelope::new(
        &stage.failed_routing_key(),
        serde_json::Value::Object(data),
    )
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;

    #[test]
    fn stage_routing() {
        assert_eq!(Stage::Parsing.consumed_event_type(), EventType::ArchiveIngested);
        assert_eq!(Stage::Chunking.failed_routing_key(), "chunking.failed");
        assert_eq!("embedding".parse::<Stage>().unwrap(), Stage::Embedding);
        assert!("ingestion".parse::<Stage>().is_err());
    }

    #[test]
    fn payload_round_trip_through_envelope() {
        let payload = EventPayload::JsonParsed(JsonParsed {
            archive_id: "ab12cd34ef56ab78".to_owned(),
            message_ids: vec!["m1".to_owned(), "m2".to_owned()],
            message_count: 2,
            failed_count: 0,
        });

        let envelope = payload.clone().into_envelope();
        assert_eq!(envelope.event_type, "json.parsed");

        let decoded = EventPayload::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn unknown_event_type_is_a_permanent_error() {
        let envelope = EventEnvelope::new("archive.deleted", json!({}));
        let error = EventPayload::from_envelope(&envelope).unwrap_err();
        assert!(!error.is_transient());
    }

    #[test]
    fn failed_envelope_extends_original_data() {
        let original = EventEnvelope::new(
            "archive.ingested",
            json!({"archive_id": "ab12cd34ef56ab78", "source_name": "ietf-quic"}),
        );
        let failure = FailureInfo {
            error_message: "corrupt mbox".to_owned(),
            error_type: "Parse Error".to_owned(),
            retry_count: 1,
            failed_at: OffsetDateTime::now_utc(),
        };

        let failed = failed_envelope(Stage::Parsing, &original, &failure);
        assert_eq!(failed.event_type, "parsing.failed");
        assert_ne!(failed.event_id, original.event_id);
        assert_json_include!(
            actual: &failed.data,
            expected: json!({
                "archive_id": "ab12cd34ef56ab78",
                "source_name": "ietf-quic",
                "source_event_id": original.event_id.to_string(),
                "error_message": "corrupt mbox",
                "error_type": "Parse Error",
                "retry_count": 1,
            })
        );
    }
}
