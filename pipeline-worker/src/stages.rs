//! The shared contract every pipeline stage implements.
//!
//! A stage consumes exactly one event type, transforms it, persists its
//! output documents under content-derived IDs (upserts, so re-running is
//! safe), and hands back the success payload to publish plus any per-item
//! failures. The runner in `worker` owns validation, retries, failed-event
//! publishing and acknowledgement; stages only do their transformation.

pub mod chunking;
pub mod embedding;
pub mod parsing;
pub mod reporting;
pub mod summarization;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{EventPayload, Stage};

/// A failure scoped to one item (one message, one thread) inside an
/// otherwise successful event. Partial success is the default: one corrupt
/// message must not sink the other 149.
#[derive(Debug)]
pub struct ItemFailure {
    pub item_id: String,
    pub error: ProcessingError,
}

/// What a stage produces for one consumed event.
#[derive(Debug)]
pub struct StageOutput {
    /// The success event to publish once the runner takes over.
    pub payload: EventPayload,
    /// Failures to route to the stage's failed queue, one event each.
    pub item_failures: Vec<ItemFailure>,
}

impl StageOutput {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            item_failures: Vec::new(),
        }
    }
}

#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Transform one validated event. Must be safe to repeat: all writes go
    /// through upsert-by-derived-ID, so redelivery converges on the same
    /// state. A returned error is judged by its kind: transient errors are
    /// retried by the runner, permanent ones go straight to the failed queue.
    async fn process(
        &self,
        envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError>;
}

/// The payload arrived on the right queue but decodes to the wrong variant;
/// indicates misconfigured bindings rather than a bad producer.
pub(crate) fn unexpected_payload(stage: Stage, payload: &EventPayload) -> ProcessingError {
    ProcessingError::invalid_input(format!(
        "stage {} cannot process {} events",
        stage,
        payload.event_type()
    ))
}
