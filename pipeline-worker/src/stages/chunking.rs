//! Chunking stage: `json.parsed` -> `chunks.prepared`.
//!
//! Fetches each parsed message and runs the token-aware splitter over its
//! normalized body. Chunk IDs derive from `(message_id, chunk_index)`, so
//! re-chunking the same message overwrites its chunks instead of growing the
//! collection.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{ChunksPrepared, EventPayload, Stage};
use pipeline_common::identity;
use pipeline_common::model::{ChunkDocument, MessageDocument};
use pipeline_common::store::{collections, DocumentStore};
use tracing::instrument;

use crate::splitter::{self, ChunkConfig, TokenCounter};
use crate::stages::{unexpected_payload, ItemFailure, StageOutput, StageProcessor};

pub struct ChunkingStage {
    store: Arc<dyn DocumentStore>,
    config: ChunkConfig,
    counter: TokenCounter,
}

impl ChunkingStage {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: ChunkConfig,
        counter: TokenCounter,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            counter,
        })
    }
}

#[async_trait]
impl StageProcessor for ChunkingStage {
    fn stage(&self) -> Stage {
        Stage::Chunking
    }

    #[instrument(skip_all, fields(archive_id))]
    async fn process(
        &self,
        _envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError> {
        let EventPayload::JsonParsed(parsed) = payload else {
            return Err(unexpected_payload(self.stage(), payload));
        };
        tracing::Span::current().record("archive_id", parsed.archive_id.as_str());

        let mut chunk_ids = Vec::new();
        let mut item_failures = Vec::new();
        let mut chunked_messages = 0usize;

        for message_id in &parsed.message_ids {
            let doc_id = identity::message_doc_id(&parsed.archive_id, message_id);
            let Some(doc) = self.store.get(collections::MESSAGES, &doc_id).await? else {
                // Parsing persists before publishing, so a missing message
                // document is data loss, not an ordering race
                item_failures.push(ItemFailure {
                    item_id: message_id.clone(),
                    error: ProcessingError::invalid_input(format!(
                        "message {} not found in store",
                        message_id
                    )),
                });
                continue;
            };
            let message: MessageDocument = serde_json::from_value(doc)?;

            let chunks = splitter::split(&message.body_normalized, &self.config, &self.counter);
            if chunks.is_empty() {
                tracing::debug!(%message_id, "empty body, no chunks produced");
            }

            for chunk in chunks {
                let id = identity::chunk_id(&message.message_id, chunk.index);
                let document = ChunkDocument {
                    id: id.clone(),
                    archive_id: message.archive_id.clone(),
                    message_id: message.message_id.clone(),
                    thread_id: message.thread_id.clone(),
                    chunk_index: chunk.index,
                    text: chunk.text,
                    token_count: chunk.token_count,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    overlap_with_previous: chunk.overlap_with_previous,
                    overlap_with_next: chunk.overlap_with_next,
                };
                self.store
                    .upsert(collections::CHUNKS, &id, serde_json::to_value(&document)?)
                    .await?;
                chunk_ids.push(id);
            }
            chunked_messages += 1;
        }

        tracing::info!(
            messages = chunked_messages,
            chunks = chunk_ids.len(),
            "archive chunked"
        );

        Ok(StageOutput {
            payload: EventPayload::ChunksPrepared(ChunksPrepared {
                archive_id: parsed.archive_id.clone(),
                chunk_count: chunk_ids.len(),
                message_count: chunked_messages,
                chunk_ids,
            }),
            item_failures,
        })
    }
}
