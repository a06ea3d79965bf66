//! Persisted document shapes.
//!
//! These are the rows each stage owns in its output collection. They travel
//! through the document store as JSON, so everything here is plain serde;
//! the `id`/`*_id` field of each struct doubles as the storage key.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A raw ingested mailbox file. Created once by ingestion, immutable after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveDocument {
    pub archive_id: String,
    pub source_name: String,
    pub file_path: String,
    pub file_hash_sha256: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
}

/// One parsed email out of an archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDocument {
    /// Storage key: hash of `(archive_id, message_id)`.
    pub id: String,
    pub archive_id: String,
    /// The `Message-ID` header value.
    pub message_id: String,
    /// Root message-id of the conversation this message belongs to.
    pub thread_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub sender: String,
    pub date: Option<String>,
    pub body_normalized: String,
    /// RFC / internet-draft names mentioned in the body.
    pub draft_mentions: Vec<String>,
}

/// A token-bounded slice of one message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkDocument {
    /// Storage key: hash of `(message_id, chunk_index)`.
    pub id: String,
    pub archive_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    /// Offsets of the core (non-overlap) span in the normalized body.
    pub start_offset: usize,
    pub end_offset: usize,
    pub overlap_with_previous: bool,
    pub overlap_with_next: bool,
}

/// An embedding vector for one chunk, keyed by the chunk's id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingDocument {
    pub chunk_id: String,
    pub message_id: String,
    pub archive_id: String,
    pub model: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub message_id: String,
    pub chunk_id: String,
    pub quote: String,
}

/// LLM output for one thread, owned by the summarization stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryDocument {
    pub id: String,
    pub thread_id: String,
    pub archive_id: String,
    pub model: String,
    pub content_markdown: String,
    pub citations: Vec<Citation>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A published report, owned by the reporting stage. Immutable once written;
/// a new summarization run produces a new report version, never an edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportDocument {
    pub report_id: String,
    pub thread_id: String,
    pub summary_id: String,
    pub version: u32,
    pub content_markdown: String,
    pub citations: Vec<Citation>,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
}

/// Durable record of one processing failure, written alongside the failed
/// event so operators can triage without consuming the failed queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedEventRecord {
    /// Storage key: the failed event's own event_id.
    pub id: String,
    pub stage: String,
    /// Routing key the original event arrived on, for requeueing.
    pub original_routing_key: String,
    /// The full original envelope, replayable as-is.
    pub original_envelope: serde_json::Value,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}
