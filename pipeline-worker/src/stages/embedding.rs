//! Embedding stage: `chunks.prepared` -> `summarization.requested`.
//!
//! Fetches the prepared chunks, embeds them in batches against the inference
//! backend, and stores one vector document per chunk keyed by the chunk's own
//! ID. The outgoing event groups the affected messages by thread so the
//! summarization stage knows which conversations changed.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{EventPayload, Stage, SummarizationRequested};
use pipeline_common::model::{ChunkDocument, EmbeddingDocument};
use pipeline_common::store::{collections, DocumentStore};
use tracing::instrument;

use crate::llm::InferenceBackend;
use crate::stages::{unexpected_payload, ItemFailure, StageOutput, StageProcessor};

pub struct EmbeddingStage {
    store: Arc<dyn DocumentStore>,
    backend: Arc<dyn InferenceBackend>,
    batch_size: usize,
}

impl EmbeddingStage {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        backend: Arc<dyn InferenceBackend>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            backend,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl StageProcessor for EmbeddingStage {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    #[instrument(skip_all, fields(archive_id, chunks))]
    async fn process(
        &self,
        _envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError> {
        let EventPayload::ChunksPrepared(prepared) = payload else {
            return Err(unexpected_payload(self.stage(), payload));
        };
        tracing::Span::current().record("archive_id", prepared.archive_id.as_str());
        tracing::Span::current().record("chunks", prepared.chunk_ids.len());

        let mut chunks: Vec<ChunkDocument> = Vec::new();
        let mut item_failures = Vec::new();
        for chunk_id in &prepared.chunk_ids {
            match self.store.get(collections::CHUNKS, chunk_id).await? {
                Some(doc) => chunks.push(serde_json::from_value(doc)?),
                None => item_failures.push(ItemFailure {
                    item_id: chunk_id.clone(),
                    error: ProcessingError::invalid_input(format!(
                        "chunk {} not found in store",
                        chunk_id
                    )),
                }),
            }
        }

        let mut thread_ids: BTreeSet<String> = BTreeSet::new();
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self.backend.embed(&texts).await?;

            for (chunk, vector) in batch.iter().zip(vectors) {
                let document = EmbeddingDocument {
                    chunk_id: chunk.id.clone(),
                    message_id: chunk.message_id.clone(),
                    archive_id: chunk.archive_id.clone(),
                    model: self.backend.embedding_model().to_owned(),
                    vector,
                };
                self.store
                    .upsert(
                        collections::EMBEDDINGS,
                        &chunk.id,
                        serde_json::to_value(&document)?,
                    )
                    .await?;
                thread_ids.insert(chunk.thread_id.clone());
            }
        }

        tracing::info!(
            embedded = prepared.chunk_ids.len() - item_failures.len(),
            threads = thread_ids.len(),
            "chunks embedded"
        );

        Ok(StageOutput {
            payload: EventPayload::SummarizationRequested(SummarizationRequested {
                archive_id: prepared.archive_id.clone(),
                thread_ids: thread_ids.into_iter().collect(),
            }),
            item_failures,
        })
    }
}
