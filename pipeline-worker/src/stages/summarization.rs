//! Summarization stage: `summarization.requested` -> `summary.complete`.
//!
//! Per thread: fetch the thread's messages and chunks, build the summary
//! prompt, call the chat backend, and persist a summary document with
//! citations back into the chunks that grounded it. Summary IDs derive from
//! `(thread_id, triggering event_id)`: redelivery upserts the same document,
//! a fresh summarization run creates a new one.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{EventPayload, Stage, SummaryComplete};
use pipeline_common::identity;
use pipeline_common::model::{Citation, ChunkDocument, MessageDocument, SummaryDocument};
use pipeline_common::store::{collections, DocumentStore};
use serde_json::json;
use time::OffsetDateTime;
use tracing::instrument;

use crate::llm::InferenceBackend;
use crate::stages::{unexpected_payload, ItemFailure, StageOutput, StageProcessor};

const SYSTEM_PROMPT: &str = "You summarize technical mailing-list threads. \
Produce a concise markdown summary of the discussion: the question raised, \
the positions taken, and any consensus reached. Quote sparingly and stay \
faithful to the messages.";

/// Per-message cap applied when building the prompt, so one long message
/// cannot crowd out the rest of the thread.
const PROMPT_BODY_LIMIT: usize = 4_000;

/// Citations per thread, taken from the first chunk of each message.
const MAX_CITATIONS: usize = 5;

pub struct SummarizationStage {
    store: Arc<dyn DocumentStore>,
    backend: Arc<dyn InferenceBackend>,
}

impl SummarizationStage {
    pub fn new(store: Arc<dyn DocumentStore>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self { store, backend }
    }

    async fn thread_messages(
        &self,
        archive_id: &str,
        thread_id: &str,
    ) -> Result<Vec<MessageDocument>, ProcessingError> {
        let docs = self
            .store
            .find(
                collections::MESSAGES,
                &json!({"archive_id": archive_id, "thread_id": thread_id}),
            )
            .await?;
        let mut messages: Vec<MessageDocument> = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        // Date headers are free-form text; the tuple keeps ordering stable
        // even when they are missing or unparseable
        messages.sort_by(|a, b| {
            (a.date.as_deref(), a.message_id.as_str())
                .cmp(&(b.date.as_deref(), b.message_id.as_str()))
        });
        Ok(messages)
    }

    async fn thread_citations(
        &self,
        archive_id: &str,
        thread_id: &str,
        messages: &[MessageDocument],
    ) -> Result<Vec<Citation>, ProcessingError> {
        let docs = self
            .store
            .find(
                collections::CHUNKS,
                &json!({"archive_id": archive_id, "thread_id": thread_id}),
            )
            .await?;
        let chunks: Vec<ChunkDocument> = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;

        let mut citations = Vec::new();
        for message in messages {
            if citations.len() >= MAX_CITATIONS {
                break;
            }
            let Some(first_chunk) = chunks
                .iter()
                .filter(|chunk| chunk.message_id == message.message_id)
                .min_by_key(|chunk| chunk.chunk_index)
            else {
                continue;
            };
            let quote: String = first_chunk.text.lines().next().unwrap_or_default().to_owned();
            citations.push(Citation {
                message_id: message.message_id.clone(),
                chunk_id: first_chunk.id.clone(),
                quote,
            });
        }
        Ok(citations)
    }

    fn build_prompt(messages: &[MessageDocument]) -> String {
        let subject = messages
            .iter()
            .map(|m| m.subject.as_str())
            .find(|s| !s.is_empty())
            .unwrap_or("(no subject)");

        let mut prompt = format!("Thread: {}\n\n", subject);
        for message in messages {
            let body: String = message.body_normalized.chars().take(PROMPT_BODY_LIMIT).collect();
            prompt.push_str(&format!("--- {} ---\n{}\n\n", message.sender, body));
        }
        prompt
    }
}

#[async_trait]
impl StageProcessor for SummarizationStage {
    fn stage(&self) -> Stage {
        Stage::Summarization
    }

    #[instrument(skip_all, fields(archive_id, threads))]
    async fn process(
        &self,
        envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError> {
        let EventPayload::SummarizationRequested(request) = payload else {
            return Err(unexpected_payload(self.stage(), payload));
        };
        tracing::Span::current().record("archive_id", request.archive_id.as_str());
        tracing::Span::current().record("threads", request.thread_ids.len());

        let mut summary_ids = Vec::new();
        let mut summarized_threads = Vec::new();
        let mut item_failures = Vec::new();

        for thread_id in &request.thread_ids {
            let messages = self
                .thread_messages(&request.archive_id, thread_id)
                .await?;
            if messages.is_empty() {
                item_failures.push(ItemFailure {
                    item_id: thread_id.clone(),
                    error: ProcessingError::invalid_input(format!(
                        "thread {} has no messages in store",
                        thread_id
                    )),
                });
                continue;
            }

            let prompt = Self::build_prompt(&messages);
            let content_markdown = match self.backend.summarize(SYSTEM_PROMPT, &prompt).await {
                Ok(content) => content,
                Err(error) if error.is_transient() => return Err(error),
                Err(error) => {
                    // A permanently rejected thread must not sink the others
                    tracing::warn!(%thread_id, "summarization rejected: {}", error);
                    item_failures.push(ItemFailure {
                        item_id: thread_id.clone(),
                        error,
                    });
                    continue;
                }
            };

            let citations = self
                .thread_citations(&request.archive_id, thread_id, &messages)
                .await?;

            let id = identity::versioned_output_id(thread_id, &envelope.event_id);
            let document = SummaryDocument {
                id: id.clone(),
                thread_id: thread_id.clone(),
                archive_id: request.archive_id.clone(),
                model: self.backend.summary_model().to_owned(),
                content_markdown,
                citations,
                created_at: OffsetDateTime::now_utc(),
            };
            self.store
                .upsert(collections::SUMMARIES, &id, serde_json::to_value(&document)?)
                .await?;
            summary_ids.push(id);
            summarized_threads.push(thread_id.clone());
        }

        tracing::info!(
            summaries = summary_ids.len(),
            failed = item_failures.len(),
            "threads summarized"
        );

        Ok(StageOutput {
            payload: EventPayload::SummaryComplete(SummaryComplete {
                archive_id: request.archive_id.clone(),
                summary_ids,
                thread_ids: summarized_threads,
            }),
            item_failures,
        })
    }
}
