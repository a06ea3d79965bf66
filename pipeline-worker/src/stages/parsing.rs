//! Parsing stage: `archive.ingested` -> `json.parsed`.
//!
//! Reads the archive file ingestion wrote, splits the mbox, parses each
//! message, assigns threads, and upserts one document per message. Messages
//! that fail to parse become per-item failures; the rest of the archive goes
//! through.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{EventPayload, JsonParsed, Stage};
use pipeline_common::identity;
use pipeline_common::model::MessageDocument;
use pipeline_common::store::{collections, DocumentStore};
use tracing::instrument;

use crate::mbox;
use crate::stages::{unexpected_payload, ItemFailure, StageOutput, StageProcessor};

pub struct ParsingStage {
    store: Arc<dyn DocumentStore>,
}

impl ParsingStage {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn read_archive(&self, file_path: &str) -> Result<String, ProcessingError> {
        match tokio::fs::read(file_path).await {
            // Archives are not reliably UTF-8; lossy decoding keeps the
            // transformation deterministic for any byte content.
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                ProcessingError::invalid_input(format!("archive file missing: {}", file_path)),
            ),
            Err(err) => Err(ProcessingError::storage(err.to_string())),
        }
    }
}

#[async_trait]
impl StageProcessor for ParsingStage {
    fn stage(&self) -> Stage {
        Stage::Parsing
    }

    #[instrument(skip_all, fields(archive_id))]
    async fn process(
        &self,
        _envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError> {
        let EventPayload::ArchiveIngested(archive) = payload else {
            return Err(unexpected_payload(self.stage(), payload));
        };
        tracing::Span::current().record("archive_id", archive.archive_id.as_str());

        let raw = self.read_archive(&archive.file_path).await?;
        let blocks = mbox::split_mbox(&raw);

        let mut parsed = Vec::new();
        let mut item_failures = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            match mbox::parse_message(block) {
                Ok(message) => parsed.push(message),
                Err(error) => {
                    tracing::warn!(index, "failed to parse message: {}", error);
                    item_failures.push(ItemFailure {
                        item_id: format!("{}#{}", archive.archive_id, index),
                        error,
                    });
                }
            }
        }

        let threads = mbox::assign_threads(&parsed);

        let mut message_ids = Vec::with_capacity(parsed.len());
        for message in &parsed {
            let thread_id = threads
                .get(&message.message_id)
                .cloned()
                .unwrap_or_else(|| message.message_id.clone());
            let id = identity::message_doc_id(&archive.archive_id, &message.message_id);
            let document = MessageDocument {
                id: id.clone(),
                archive_id: archive.archive_id.clone(),
                message_id: message.message_id.clone(),
                thread_id,
                in_reply_to: message.in_reply_to.clone(),
                references: message.references.clone(),
                subject: message.subject.clone(),
                sender: message.sender.clone(),
                date: message.date.clone(),
                body_normalized: message.body_normalized.clone(),
                draft_mentions: message.draft_mentions.clone(),
            };
            self.store
                .upsert(collections::MESSAGES, &id, serde_json::to_value(&document)?)
                .await?;
            message_ids.push(message.message_id.clone());
        }

        tracing::info!(
            parsed = message_ids.len(),
            failed = item_failures.len(),
            "archive parsed"
        );

        Ok(StageOutput {
            payload: EventPayload::JsonParsed(JsonParsed {
                archive_id: archive.archive_id.clone(),
                message_count: message_ids.len(),
                failed_count: item_failures.len(),
                message_ids,
            }),
            item_failures,
        })
    }
}
