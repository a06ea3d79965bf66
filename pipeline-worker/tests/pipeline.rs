//! End-to-end tests for the stage runner over the in-memory bus and store,
//! using the schema files shipped in `schemas/`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthRegistry;
use pipeline_common::bus::{EventBus, MemoryBus};
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{ArchiveIngested, EventPayload};
use pipeline_common::identity;
use pipeline_common::retry::RetryPolicy;
use pipeline_common::schema::{FilesystemSchemaSource, SchemaRegistry};
use pipeline_common::store::{collections, DocumentStore, MemoryDocumentStore};
use pipeline_worker::llm::InferenceBackend;
use pipeline_worker::splitter::{ChunkConfig, TokenCounter};
use pipeline_worker::stages::chunking::ChunkingStage;
use pipeline_worker::stages::embedding::EmbeddingStage;
use pipeline_worker::stages::parsing::ParsingStage;
use pipeline_worker::stages::reporting::ReportingStage;
use pipeline_worker::stages::summarization::SummarizationStage;
use pipeline_worker::stages::StageProcessor;
use pipeline_worker::stats::StageStats;
use pipeline_worker::worker::StageWorker;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

struct StubBackend {
    fail_transiently: bool,
}

#[async_trait]
impl InferenceBackend for StubBackend {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProcessingError> {
        if self.fail_transiently {
            return Err(ProcessingError::timeout("backend unreachable"));
        }
        Ok(inputs.iter().map(|text| vec![text.len() as f32, 1.0]).collect())
    }

    async fn summarize(&self, _system: &str, user: &str) -> Result<String, ProcessingError> {
        if self.fail_transiently {
            return Err(ProcessingError::timeout("backend unreachable"));
        }
        Ok(format!("## Thread summary\n\nBased on {} chars.", user.len()))
    }

    fn embedding_model(&self) -> &str {
        "stub-embedding"
    }

    fn summary_model(&self) -> &str {
        "stub-chat"
    }
}

struct Harness {
    bus: MemoryBus,
    store: Arc<MemoryDocumentStore>,
    registry: Arc<SchemaRegistry>,
    health: HealthRegistry,
}

impl Harness {
    async fn new() -> Self {
        let registry = Arc::new(
            SchemaRegistry::from_source(&FilesystemSchemaSource::new("../schemas"))
                .await
                .expect("workspace schemas load"),
        );
        Self {
            bus: MemoryBus::new(),
            store: Arc::new(MemoryDocumentStore::new()),
            registry,
            health: HealthRegistry::new("liveness"),
        }
    }

    async fn worker(
        &self,
        processor: Arc<dyn StageProcessor>,
        stats: Arc<StageStats>,
    ) -> StageWorker {
        let stage = processor.stage();
        let consumer = Arc::new(self.bus.consumer(stage.consumed_event_type().as_str()));
        let liveness = self
            .health
            .register(format!("{}-loop", stage), time::Duration::seconds(60))
            .await;
        StageWorker::new(
            processor,
            consumer,
            Arc::new(self.bus.clone()),
            self.store.clone(),
            self.registry.clone(),
            RetryPolicy::new(2, 2, Duration::from_millis(1), None),
            stats,
            liveness,
        )
    }
}

fn sample_mbox(messages: usize, corrupt_index: Option<usize>) -> String {
    let mut raw = String::new();
    for i in 0..messages {
        let message_id_header = match corrupt_index {
            Some(corrupt) if corrupt == i => String::new(),
            _ => format!("Message-ID: <msg-{}@example.org>\n", i),
        };
        let reply_header = if i == 0 {
            String::new()
        } else {
            "In-Reply-To: <msg-0@example.org>\n".to_owned()
        };
        raw.push_str(&format!(
            "From sender{i}@example.org Thu Jan  1 10:00:00 2026\n\
             From: Sender {i} <sender{i}@example.org>\n\
             Subject: Padding discussion\n\
             {message_id_header}{reply_header}\n\
             Message {i} raises a question about draft-ietf-quic-transport padding.\n\
             It follows up on RFC 9000 section 8 with more detail.\n\n",
            i = i,
            message_id_header = message_id_header,
            reply_header = reply_header,
        ));
    }
    raw
}

fn write_archive(content: &str) -> (String, String) {
    let path = std::env::temp_dir().join(format!("pipeline-{}.mbox", Uuid::now_v7()));
    std::fs::write(&path, content).unwrap();
    (
        path.to_string_lossy().into_owned(),
        identity::archive_id(content.as_bytes()),
    )
}

async fn publish_archive_ingested(bus: &MemoryBus, archive_id: &str, file_path: &str) {
    let payload = EventPayload::ArchiveIngested(ArchiveIngested {
        archive_id: archive_id.to_owned(),
        source_name: "ietf-quic".to_owned(),
        file_path: file_path.to_owned(),
        file_hash_sha256: "ab".repeat(32),
        ingested_at: OffsetDateTime::now_utc(),
    });
    let envelope = payload.into_envelope();
    bus.publish("archive.ingested", &envelope).await.unwrap();
}

#[tokio::test]
async fn events_flow_through_all_five_stages() {
    let harness = Harness::new().await;
    let backend = Arc::new(StubBackend {
        fail_transiently: false,
    });

    let counter = TokenCounter::cl100k().unwrap();
    let parsing = harness
        .worker(
            Arc::new(ParsingStage::new(harness.store.clone())),
            Arc::new(StageStats::new()),
        )
        .await;
    let chunking = harness
        .worker(
            Arc::new(
                ChunkingStage::new(harness.store.clone(), ChunkConfig::default(), counter).unwrap(),
            ),
            Arc::new(StageStats::new()),
        )
        .await;
    let embedding = harness
        .worker(
            Arc::new(EmbeddingStage::new(
                harness.store.clone(),
                backend.clone(),
                8,
            )),
            Arc::new(StageStats::new()),
        )
        .await;
    let summarization = harness
        .worker(
            Arc::new(SummarizationStage::new(harness.store.clone(), backend)),
            Arc::new(StageStats::new()),
        )
        .await;
    let reporting = harness
        .worker(
            Arc::new(ReportingStage::new(harness.store.clone())),
            Arc::new(StageStats::new()),
        )
        .await;

    let (path, archive_id) = write_archive(&sample_mbox(4, None));
    publish_archive_ingested(&harness.bus, &archive_id, &path).await;

    parsing.step().await.unwrap();
    chunking.step().await.unwrap();
    embedding.step().await.unwrap();
    summarization.step().await.unwrap();
    reporting.step().await.unwrap();

    assert_eq!(harness.store.len(collections::MESSAGES), 4);
    assert!(harness.store.len(collections::CHUNKS) >= 4);
    assert_eq!(
        harness.store.len(collections::EMBEDDINGS),
        harness.store.len(collections::CHUNKS)
    );
    // All four messages reply into one thread
    assert_eq!(harness.store.len(collections::SUMMARIES), 1);
    assert_eq!(harness.store.len(collections::REPORTS), 1);

    for routing_key in [
        "json.parsed",
        "chunks.prepared",
        "summarization.requested",
        "summary.complete",
        "report.published",
    ] {
        assert_eq!(
            harness.bus.published(routing_key).len(),
            1,
            "expected exactly one {} event",
            routing_key
        );
    }

    let report = harness
        .store
        .find(collections::REPORTS, &json!({}))
        .await
        .unwrap()
        .remove(0);
    assert!(report["content_markdown"]
        .as_str()
        .unwrap()
        .starts_with("## Thread summary"));
    assert_eq!(report["version"], json!(1));

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn one_corrupt_message_yields_one_failed_record_and_nine_documents() {
    let harness = Harness::new().await;
    let stats = Arc::new(StageStats::new());
    let parsing = harness
        .worker(Arc::new(ParsingStage::new(harness.store.clone())), stats.clone())
        .await;

    let (path, archive_id) = write_archive(&sample_mbox(10, Some(5)));
    publish_archive_ingested(&harness.bus, &archive_id, &path).await;
    parsing.step().await.unwrap();

    // 9 good messages persisted, the corrupt one recorded exactly once
    assert_eq!(harness.store.len(collections::MESSAGES), 9);
    assert_eq!(harness.store.len(collections::FAILED_EVENTS), 1);

    let failed_events = harness.bus.published("parsing.failed");
    assert_eq!(failed_events.len(), 1);
    assert_eq!(
        failed_events[0]["data"]["failed_item_id"],
        json!(format!("{}#5", archive_id))
    );
    assert_eq!(failed_events[0]["data"]["error_type"], json!("Parse Error"));

    // The success event still goes out, reporting the partial failure
    let parsed = harness.bus.published("json.parsed");
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0]["data"]["message_count"], json!(9));
    assert_eq!(parsed[0]["data"]["failed_count"], json!(1));

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn duplicate_delivery_converges_instead_of_duplicating() {
    let harness = Harness::new().await;
    let parsing = harness
        .worker(
            Arc::new(ParsingStage::new(harness.store.clone())),
            Arc::new(StageStats::new()),
        )
        .await;

    let (path, archive_id) = write_archive(&sample_mbox(3, None));
    // The broker delivers the same event twice
    publish_archive_ingested(&harness.bus, &archive_id, &path).await;
    let duplicate = harness.bus.published("archive.ingested").remove(0);
    harness.bus.publish_raw("archive.ingested", duplicate);

    parsing.step().await.unwrap();
    parsing.step().await.unwrap();

    // Same derived IDs, so the second run upserts over the first
    assert_eq!(harness.store.len(collections::MESSAGES), 3);
    // Duplicate success events are allowed; downstream is idempotent too
    assert_eq!(harness.bus.published("json.parsed").len(), 2);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn schema_violations_are_rejected_not_failed() {
    let harness = Harness::new().await;
    let stats = Arc::new(StageStats::new());
    let parsing = harness
        .worker(Arc::new(ParsingStage::new(harness.store.clone())), stats.clone())
        .await;

    // Envelope is well-formed but the payload is missing required fields
    let envelope = EventEnvelope::new("archive.ingested", json!({"archive_id": "ab12cd34ef56ab78"}));
    harness
        .bus
        .publish_raw("archive.ingested", serde_json::to_value(&envelope).unwrap());

    parsing.step().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.rejected, 1);
    assert_eq!(snapshot.processed, 0);
    assert_eq!(snapshot.failed, 0);
    // Rejections are dropped, never routed to the failed queue
    assert!(harness.store.is_empty(collections::FAILED_EVENTS));
    assert!(harness.bus.published("parsing.failed").is_empty());
    assert!(harness.bus.published("json.parsed").is_empty());
}

#[tokio::test]
async fn exhausted_retries_land_in_the_failed_queue() {
    let harness = Harness::new().await;
    let stats = Arc::new(StageStats::new());
    let summarization = harness
        .worker(
            Arc::new(SummarizationStage::new(
                harness.store.clone(),
                Arc::new(StubBackend {
                    fail_transiently: true,
                }),
            )),
            stats.clone(),
        )
        .await;

    // Seed one message so the stage reaches the backend call
    let message = pipeline_common::model::MessageDocument {
        id: identity::message_doc_id("ab12cd34ef56ab78", "<m1@x>"),
        archive_id: "ab12cd34ef56ab78".to_owned(),
        message_id: "<m1@x>".to_owned(),
        thread_id: "<m1@x>".to_owned(),
        in_reply_to: None,
        references: Vec::new(),
        subject: "s".to_owned(),
        sender: "a@x".to_owned(),
        date: None,
        body_normalized: "body".to_owned(),
        draft_mentions: Vec::new(),
    };
    harness
        .store
        .upsert(
            collections::MESSAGES,
            &message.id.clone(),
            serde_json::to_value(&message).unwrap(),
        )
        .await
        .unwrap();

    let payload = EventPayload::SummarizationRequested(
        pipeline_common::events::SummarizationRequested {
            archive_id: "ab12cd34ef56ab78".to_owned(),
            thread_ids: vec!["<m1@x>".to_owned()],
        },
    );
    let envelope = payload.into_envelope();
    harness
        .bus
        .publish("summarization.requested", &envelope)
        .await
        .unwrap();

    summarization.step().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.retried, 1); // two attempts, one retry
    assert_eq!(snapshot.processed, 0);

    // Durable record plus the failed-queue event, both carrying the context
    // an operator needs for triage
    assert_eq!(harness.store.len(collections::FAILED_EVENTS), 1);
    let record = harness
        .store
        .find(collections::FAILED_EVENTS, &json!({"stage": "summarization"}))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(record["error_type"], json!("Timeout Error"));
    assert_eq!(record["retry_count"], json!(1));
    assert_eq!(record["original_routing_key"], json!("summarization.requested"));

    let failed = harness.bus.published("summarization.failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["data"]["error_type"], json!("Timeout Error"));
    assert!(harness.store.is_empty(collections::SUMMARIES));
    assert!(harness.bus.published("summary.complete").is_empty());
}

#[tokio::test]
async fn redelivery_after_crash_between_persist_and_publish_is_safe() {
    let harness = Harness::new().await;
    let parsing = harness
        .worker(
            Arc::new(ParsingStage::new(harness.store.clone())),
            Arc::new(StageStats::new()),
        )
        .await;

    let (path, archive_id) = write_archive(&sample_mbox(2, None));
    publish_archive_ingested(&harness.bus, &archive_id, &path).await;
    parsing.step().await.unwrap();
    assert_eq!(harness.store.len(collections::MESSAGES), 2);

    // Simulate the broker redelivering after a crash-before-ack: processing
    // again re-upserts the same documents and re-publishes the success event
    let original = harness.bus.published("archive.ingested").remove(0);
    harness.bus.publish_raw("archive.ingested", original);
    parsing.step().await.unwrap();

    assert_eq!(harness.store.len(collections::MESSAGES), 2);
    assert_eq!(harness.bus.published("json.parsed").len(), 2);

    std::fs::remove_file(&path).ok();
}
