//! The shared stage runner.
//!
//! Drives one `StageProcessor` through the contract every stage shares:
//!
//! ```text
//! Received -> Validated -> Processing -> { Persisted+Published | Failed }
//! ```
//!
//! Shape failures (envelope or schema) are acknowledged and dropped — they
//! mean a malformed producer and retrying cannot fix them. Processing runs
//! under the retry policy; transient errors back off locally, and once
//! attempts are exhausted (or the error is permanent) the runner records a
//! durable failure document, publishes the `<stage>.failed` event, and
//! acknowledges the original so the queue never wedges.
//!
//! Persist-before-publish holds throughout: stages upsert their documents
//! inside `process`, the success event goes out afterwards, and the delivery
//! is acknowledged last. A crash between those steps causes redelivery, which
//! is safe because every write is an upsert under a content-derived ID.

use std::sync::Arc;

use health::HealthHandle;
use metrics::counter;
use pipeline_common::bus::{BusError, DeliveryTag, EventBus, EventConsumer};
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::error::ProcessingError;
use pipeline_common::events::{failed_envelope, EventPayload, FailureInfo, Stage};
use pipeline_common::model::FailedEventRecord;
use pipeline_common::retry::{run_with_retries, RetryPolicy};
use pipeline_common::schema::SchemaRegistry;
use pipeline_common::store::{collections, DocumentStore};
use serde_json::Value;
use tracing::{error, warn};

use crate::error::WorkerError;
use crate::stages::{ItemFailure, StageProcessor};
use crate::stats::StageStats;

pub struct StageWorker {
    stage: Stage,
    processor: Arc<dyn StageProcessor>,
    consumer: Arc<dyn EventConsumer>,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn DocumentStore>,
    registry: Arc<SchemaRegistry>,
    retry_policy: RetryPolicy,
    stats: Arc<StageStats>,
    liveness: HealthHandle,
}

impl StageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor: Arc<dyn StageProcessor>,
        consumer: Arc<dyn EventConsumer>,
        bus: Arc<dyn EventBus>,
        store: Arc<dyn DocumentStore>,
        registry: Arc<SchemaRegistry>,
        retry_policy: RetryPolicy,
        stats: Arc<StageStats>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            stage: processor.stage(),
            processor,
            consumer,
            bus,
            store,
            registry,
            retry_policy,
            stats,
            liveness,
        }
    }

    /// Consume and process deliveries until the consumer fails terminally.
    pub async fn run(&self) -> Result<(), WorkerError> {
        loop {
            self.step().await?;
        }
    }

    /// Process exactly one delivery (or drop one undecodable payload).
    pub async fn step(&self) -> Result<(), WorkerError> {
        let (raw, tag) = match self.consumer.recv().await {
            Ok(delivery) => delivery,
            Err(BusError::Malformed(message)) => {
                // Already acknowledged by the consumer; a poison pill must
                // not wedge the partition
                warn!("dropping undecodable payload: {}", message);
                self.record_rejected("undecodable");
                return Ok(());
            }
            Err(other) => return Err(other.into()),
        };
        self.liveness.report_healthy().await;

        // Received -> Validated
        if let Err(validation) = self.registry.validate(&raw) {
            warn!("rejecting event failing validation: {}", validation);
            self.record_rejected("schema");
            return self.ack(tag).await;
        }

        let (envelope, payload) = match decode(&raw) {
            Ok(decoded) => decoded,
            Err(decode_error) => {
                // Validated but undecodable means the registry's schema has
                // drifted from the payload types; still a shape failure
                warn!("rejecting validated event that does not decode: {}", decode_error);
                self.record_rejected("decode");
                return self.ack(tag).await;
            }
        };

        if envelope.event_type != self.stage.consumed_event_type().as_str() {
            warn!(
                event_type = %envelope.event_type,
                "rejecting event type this stage does not consume"
            );
            self.record_rejected("routing");
            return self.ack(tag).await;
        }

        // Validated -> Processing, under the retry policy
        let stats = self.stats.clone();
        let stage_label = self.stage.as_str();
        let result = run_with_retries(&self.retry_policy, |attempt| {
            if attempt > 0 {
                stats.record_retry();
                counter!("pipeline_event_retries_total", "stage" => stage_label).increment(1);
            }
            let processor = self.processor.clone();
            let envelope = envelope.clone();
            let payload = payload.clone();
            async move { processor.process(&envelope, &payload).await }
        })
        .await;

        match result {
            Ok(output) => {
                for item in &output.item_failures {
                    if let Err(publish_error) = self.publish_item_failure(&envelope, item).await {
                        error!("failed to record item failure: {}", publish_error);
                        return Ok(()); // no ack; redelivery will retry
                    }
                }

                // Persisted -> Published
                let success = output.payload.into_envelope();
                if let Err(validation) = self.registry.validate_outbound(&success) {
                    // Our own producer bug; park the event as a failure
                    error!("produced event fails validation: {}", validation);
                    let processing = ProcessingError::invalid_input(validation.to_string());
                    let info = FailureInfo::from_error(&processing, 0);
                    if let Err(record_error) = self.record_failure(&envelope, &info, None).await {
                        error!("failed to record failure: {}", record_error);
                        return Ok(()); // no ack
                    }
                    self.record_failed();
                    return self.ack(tag).await;
                }

                if let Err(publish_error) = self
                    .bus
                    .publish(success.event_type.as_str(), &success)
                    .await
                {
                    // Documents are persisted; skipping the ack hands the
                    // event back to the bus, and the idempotent upserts make
                    // the redelivered run converge to a re-publish
                    warn!("publish failed, leaving delivery unacked: {}", publish_error);
                    return Ok(());
                }

                self.record_processed();
                self.ack(tag).await
            }
            Err(exhausted) => {
                let retry_count = exhausted.attempts.saturating_sub(1);
                let info = FailureInfo::from_error(&exhausted.error, retry_count);
                if let Err(record_error) = self.record_failure(&envelope, &info, None).await {
                    error!("failed to record failure: {}", record_error);
                    return Ok(()); // no ack; redelivery will retry
                }
                self.record_failed();
                self.ack(tag).await
            }
        }
    }

    /// Publish one `<stage>.failed` event for a single failed item and write
    /// the durable failure record.
    async fn publish_item_failure(
        &self,
        original: &EventEnvelope,
        item: &ItemFailure,
    ) -> Result<(), BusError> {
        let info = FailureInfo::from_error(&item.error, 0);
        self.record_failure(original, &info, Some(&item.item_id))
            .await?;
        counter!("pipeline_items_failed_total", "stage" => self.stage.as_str()).increment(1);
        Ok(())
    }

    /// Durable failure path: persist the record first, then publish to the
    /// stage's failed queue. Operators requeue from the record, so the write
    /// must never be skipped.
    async fn record_failure(
        &self,
        original: &EventEnvelope,
        info: &FailureInfo,
        item_id: Option<&str>,
    ) -> Result<(), BusError> {
        let mut failed = failed_envelope(self.stage, original, info);
        if let Some(item_id) = item_id {
            if let Value::Object(data) = &mut failed.data {
                data.insert("failed_item_id".to_owned(), Value::String(item_id.to_owned()));
            }
        }

        // Record id derives from the original event and item, not the failed
        // event's fresh id, so a redelivered failure upserts one record
        let record_id = pipeline_common::identity::failure_record_id(
            self.stage.as_str(),
            &original.event_id,
            item_id,
        );
        if let Err(validation) = self.registry.validate_outbound(&failed) {
            // Never drop failure data over our own schema drift
            error!("failed event fails validation, publishing anyway: {}", validation);
        }

        let record = FailedEventRecord {
            id: record_id,
            stage: self.stage.as_str().to_owned(),
            original_routing_key: original.event_type.clone(),
            original_envelope: serde_json::to_value(original)
                .unwrap_or(Value::Null),
            error_message: info.error_message.clone(),
            error_type: info.error_type.clone(),
            retry_count: info.retry_count,
            failed_at: info.failed_at,
        };
        self.store
            .upsert(
                collections::FAILED_EVENTS,
                &record.id,
                serde_json::to_value(&record).unwrap_or(Value::Null),
            )
            .await
            .map_err(|store_error| BusError::Publish {
                routing_key: self.stage.failed_routing_key(),
                error: store_error.to_string(),
            })?;

        self.bus
            .publish(&self.stage.failed_routing_key(), &failed)
            .await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.consumer.ack(tag).await?;
        Ok(())
    }

    fn record_processed(&self) {
        self.stats.record_processed();
        counter!("pipeline_events_processed_total", "stage" => self.stage.as_str()).increment(1);
    }

    fn record_failed(&self) {
        self.stats.record_failed();
        counter!("pipeline_events_failed_total", "stage" => self.stage.as_str()).increment(1);
    }

    fn record_rejected(&self, reason: &'static str) {
        self.stats.record_rejected();
        counter!(
            "pipeline_events_rejected_total",
            "stage" => self.stage.as_str(),
            "reason" => reason
        )
        .increment(1);
    }
}

fn decode(raw: &Value) -> Result<(EventEnvelope, EventPayload), ProcessingError> {
    let envelope: EventEnvelope = serde_json::from_value(raw.clone())?;
    let payload = EventPayload::from_envelope(&envelope)?;
    Ok((envelope, payload))
}
