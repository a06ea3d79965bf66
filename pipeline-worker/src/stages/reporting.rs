//! Reporting stage: `summary.complete` -> `report.published`.
//!
//! Turns summaries into immutable, version-stamped report documents for the
//! downstream read-only consumers. A report is never edited in place: a new
//! summarization run arrives as a new summary and becomes the next version
//! for its thread.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{EventPayload, ReportPublished, Stage};
use pipeline_common::identity;
use pipeline_common::model::{ReportDocument, SummaryDocument};
use pipeline_common::store::{collections, DocumentStore};
use serde_json::json;
use time::OffsetDateTime;
use tracing::instrument;

use crate::stages::{unexpected_payload, ItemFailure, StageOutput, StageProcessor};

pub struct ReportingStage {
    store: Arc<dyn DocumentStore>,
}

impl ReportingStage {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Version for a new report of this thread. If the derived report id
    /// already exists (redelivered event), its stored version is reused so
    /// the upsert is a no-op rather than a bump.
    async fn next_version(
        &self,
        thread_id: &str,
        report_id: &str,
    ) -> Result<u32, ProcessingError> {
        let existing = self
            .store
            .find(collections::REPORTS, &json!({"thread_id": thread_id}))
            .await?;

        for doc in &existing {
            if doc.get("report_id").and_then(|v| v.as_str()) == Some(report_id) {
                let version = doc.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
                return Ok(version as u32);
            }
        }
        Ok(existing.len() as u32 + 1)
    }
}

#[async_trait]
impl StageProcessor for ReportingStage {
    fn stage(&self) -> Stage {
        Stage::Reporting
    }

    #[instrument(skip_all, fields(archive_id))]
    async fn process(
        &self,
        envelope: &EventEnvelope,
        payload: &EventPayload,
    ) -> Result<StageOutput, ProcessingError> {
        let EventPayload::SummaryComplete(complete) = payload else {
            return Err(unexpected_payload(self.stage(), payload));
        };
        tracing::Span::current().record("archive_id", complete.archive_id.as_str());

        let mut report_ids = Vec::new();
        let mut thread_ids = Vec::new();
        let mut item_failures = Vec::new();

        for summary_id in &complete.summary_ids {
            let Some(doc) = self.store.get(collections::SUMMARIES, summary_id).await? else {
                item_failures.push(ItemFailure {
                    item_id: summary_id.clone(),
                    error: ProcessingError::invalid_input(format!(
                        "summary {} not found in store",
                        summary_id
                    )),
                });
                continue;
            };
            let summary: SummaryDocument = serde_json::from_value(doc)?;

            let report_id = identity::versioned_output_id(&summary.thread_id, &envelope.event_id);
            let version = self.next_version(&summary.thread_id, &report_id).await?;
            let document = ReportDocument {
                report_id: report_id.clone(),
                thread_id: summary.thread_id.clone(),
                summary_id: summary.id.clone(),
                version,
                content_markdown: summary.content_markdown.clone(),
                citations: summary.citations.clone(),
                published_at: OffsetDateTime::now_utc(),
            };
            self.store
                .upsert(
                    collections::REPORTS,
                    &report_id,
                    serde_json::to_value(&document)?,
                )
                .await?;

            report_ids.push(report_id);
            thread_ids.push(summary.thread_id);
        }

        tracing::info!(reports = report_ids.len(), "reports published");

        Ok(StageOutput {
            payload: EventPayload::ReportPublished(ReportPublished {
                report_ids,
                thread_ids,
            }),
            item_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use pipeline_common::events::SummaryComplete;
    use pipeline_common::model::Citation;
    use pipeline_common::store::MemoryDocumentStore;
    use uuid::Uuid;

    use super::*;

    const ARCHIVE_ID: &str = "ab12cd34ef56ab78";

    async fn seed_summary(store: &MemoryDocumentStore, thread_id: &str) -> String {
        let id = identity::versioned_output_id(thread_id, &Uuid::now_v7());
        let document = SummaryDocument {
            id: id.clone(),
            thread_id: thread_id.to_owned(),
            archive_id: ARCHIVE_ID.to_owned(),
            model: "stub-chat".to_owned(),
            content_markdown: "## Summary\n\nConsensus was reached.".to_owned(),
            citations: vec![Citation {
                message_id: "<m1@x>".to_owned(),
                chunk_id: "chunk-1".to_owned(),
                quote: "the padding question".to_owned(),
            }],
            created_at: OffsetDateTime::now_utc(),
        };
        store
            .upsert(
                collections::SUMMARIES,
                &id,
                serde_json::to_value(&document).unwrap(),
            )
            .await
            .unwrap();
        id
    }

    fn complete(summary_ids: Vec<String>, thread_ids: Vec<String>) -> (EventEnvelope, EventPayload) {
        let payload = EventPayload::SummaryComplete(SummaryComplete {
            archive_id: ARCHIVE_ID.to_owned(),
            summary_ids,
            thread_ids,
        });
        (payload.clone().into_envelope(), payload)
    }

    #[tokio::test]
    async fn publishes_a_versioned_report_per_summary() {
        let store = Arc::new(MemoryDocumentStore::new());
        let summary_id = seed_summary(&store, "<root@x>").await;
        let stage = ReportingStage::new(store.clone());
        let (envelope, payload) = complete(vec![summary_id.clone()], vec!["<root@x>".to_owned()]);

        let output = stage.process(&envelope, &payload).await.unwrap();
        let EventPayload::ReportPublished(published) = &output.payload else {
            panic!("wrong payload type");
        };

        assert_eq!(published.report_ids.len(), 1);
        let doc = store
            .get(collections::REPORTS, &published.report_ids[0])
            .await
            .unwrap()
            .unwrap();
        let report: ReportDocument = serde_json::from_value(doc).unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.summary_id, summary_id);
        assert_eq!(report.citations.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_does_not_bump_the_version() {
        let store = Arc::new(MemoryDocumentStore::new());
        let summary_id = seed_summary(&store, "<root@x>").await;
        let stage = ReportingStage::new(store.clone());
        let (envelope, payload) = complete(vec![summary_id], vec!["<root@x>".to_owned()]);

        stage.process(&envelope, &payload).await.unwrap();
        stage.process(&envelope, &payload).await.unwrap();

        assert_eq!(store.len(collections::REPORTS), 1);
        let reports = store
            .find(collections::REPORTS, &json!({"thread_id": "<root@x>"}))
            .await
            .unwrap();
        assert_eq!(reports[0]["version"], json!(1));
    }

    #[tokio::test]
    async fn a_new_run_becomes_the_next_version() {
        let store = Arc::new(MemoryDocumentStore::new());
        let first_summary = seed_summary(&store, "<root@x>").await;
        let stage = ReportingStage::new(store.clone());
        let (envelope, payload) = complete(vec![first_summary], vec!["<root@x>".to_owned()]);
        stage.process(&envelope, &payload).await.unwrap();

        let second_summary = seed_summary(&store, "<root@x>").await;
        let (envelope, payload) = complete(vec![second_summary], vec!["<root@x>".to_owned()]);
        stage.process(&envelope, &payload).await.unwrap();

        assert_eq!(store.len(collections::REPORTS), 2);
        let reports = store
            .find(collections::REPORTS, &json!({"thread_id": "<root@x>"}))
            .await
            .unwrap();
        let mut versions: Vec<u64> = reports
            .iter()
            .map(|doc| doc["version"].as_u64().unwrap())
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_summary_is_an_item_failure() {
        let store = Arc::new(MemoryDocumentStore::new());
        let stage = ReportingStage::new(store.clone());
        let (envelope, payload) = complete(vec!["gone".to_owned()], vec!["<root@x>".to_owned()]);

        let output = stage.process(&envelope, &payload).await.unwrap();
        assert_eq!(output.item_failures.len(), 1);
        assert!(store.is_empty(collections::REPORTS));
        let EventPayload::ReportPublished(published) = &output.payload else {
            panic!("wrong payload type");
        };
        assert!(published.report_ids.is_empty());
    }
}
