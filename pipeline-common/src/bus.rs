//! Event bus contract.
//!
//! The transport guarantees at-least-once delivery to some consumer of each
//! bound queue and nothing more: no dedup, no cross-key ordering. Everything
//! downstream of this trait is written to survive duplicates and reordering,
//! so implementations stay thin.

pub mod kafka;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::error::ProcessingError;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to publish to {routing_key}: {error}")]
    Publish { routing_key: String, error: String },
    #[error("failed to receive: {0}")]
    Receive(String),
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),
}

impl From<BusError> for ProcessingError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Malformed(message) => ProcessingError::parse(message),
            other => ProcessingError::connection(other.to_string()),
        }
    }
}

/// Opaque receipt for one delivery, handed back on ack.
#[derive(Debug)]
pub struct DeliveryTag {
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) token: u64,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one envelope under a routing key. Returns after the transport
    /// has accepted the message (broker ack for Kafka).
    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Wait for the next delivery on the bound routing key. The payload comes
    /// back as raw JSON: schema validation has not happened yet.
    ///
    /// A payload that does not even parse as JSON is acknowledged internally
    /// (poison pills must not wedge the queue) and surfaced as
    /// `BusError::Malformed`.
    async fn recv(&self) -> Result<(Value, DeliveryTag), BusError>;

    /// Acknowledge a delivery after persist+publish has completed.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError>;
}

struct MemoryBusState {
    queues: Mutex<HashMap<String, VecDeque<(u64, Value)>>>,
    published: Mutex<Vec<(String, Value)>>,
    next_token: AtomicU64,
}

/// In-process bus for tests and local runs. Keeps a log of everything
/// published so tests can assert on emitted events, and lets a consumer
/// redeliver unacknowledged messages to exercise at-least-once behavior.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<MemoryBusState>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryBusState {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Push a raw JSON value onto a routing key, bypassing the envelope type.
    /// Lets tests inject malformed producers and duplicate deliveries.
    pub fn publish_raw(&self, routing_key: &str, value: Value) {
        let token = self.state.next_token.fetch_add(1, Ordering::SeqCst);
        self.state
            .queues
            .lock()
            .expect("poisoned memory bus lock")
            .entry(routing_key.to_owned())
            .or_default()
            .push_back((token, value.clone()));
        self.state
            .published
            .lock()
            .expect("poisoned memory bus lock")
            .push((routing_key.to_owned(), value));
    }

    /// Everything published under a routing key, in publish order.
    pub fn published(&self, routing_key: &str) -> Vec<Value> {
        self.state
            .published
            .lock()
            .expect("poisoned memory bus lock")
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Bind a consumer to one routing key.
    pub fn consumer(&self, routing_key: &str) -> MemoryConsumer {
        MemoryConsumer {
            state: self.state.clone(),
            routing_key: routing_key.to_owned(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> Result<(), BusError> {
        let value = serde_json::to_value(envelope).map_err(|err| BusError::Publish {
            routing_key: routing_key.to_owned(),
            error: err.to_string(),
        })?;
        self.publish_raw(routing_key, value);
        Ok(())
    }
}

pub struct MemoryConsumer {
    state: Arc<MemoryBusState>,
    routing_key: String,
    in_flight: Mutex<HashMap<u64, Value>>,
}

impl MemoryConsumer {
    /// Put every unacknowledged delivery back on the queue, simulating the
    /// broker redelivering after a consumer crash.
    pub fn redeliver_unacked(&self) {
        let mut in_flight = self.in_flight.lock().expect("poisoned memory bus lock");
        if in_flight.is_empty() {
            return;
        }
        let mut queues = self.state.queues.lock().expect("poisoned memory bus lock");
        let queue = queues.entry(self.routing_key.clone()).or_default();
        let mut entries: Vec<(u64, Value)> = in_flight.drain().collect();
        entries.sort_by_key(|(token, _)| *token);
        for entry in entries {
            queue.push_back(entry);
        }
    }

    pub fn unacked(&self) -> usize {
        self.in_flight.lock().expect("poisoned memory bus lock").len()
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn recv(&self) -> Result<(Value, DeliveryTag), BusError> {
        // Short-interval polling, like a consumer long-polling its queue
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(10));
        loop {
            {
                let mut queues = self.state.queues.lock().expect("poisoned memory bus lock");
                if let Some(queue) = queues.get_mut(&self.routing_key) {
                    if let Some((token, value)) = queue.pop_front() {
                        self.in_flight
                            .lock()
                            .expect("poisoned memory bus lock")
                            .insert(token, value.clone());
                        return Ok((
                            value,
                            DeliveryTag {
                                partition: 0,
                                offset: 0,
                                token,
                            },
                        ));
                    }
                }
            }
            interval.tick().await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.in_flight
            .lock()
            .expect("poisoned memory bus lock")
            .remove(&tag.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::EventEnvelope;

    #[tokio::test]
    async fn publish_and_consume() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("archive.ingested");

        let envelope = EventEnvelope::new("archive.ingested", json!({"archive_id": "ab12"}));
        bus.publish("archive.ingested", &envelope).await.unwrap();

        let (value, tag) = consumer.recv().await.unwrap();
        assert_eq!(value["data"]["archive_id"], "ab12");
        assert_eq!(consumer.unacked(), 1);

        consumer.ack(tag).await.unwrap();
        assert_eq!(consumer.unacked(), 0);
        assert_eq!(bus.published("archive.ingested").len(), 1);
    }

    #[tokio::test]
    async fn unacked_messages_can_be_redelivered() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("json.parsed");

        let envelope = EventEnvelope::new("json.parsed", json!({"archive_id": "ab12"}));
        bus.publish("json.parsed", &envelope).await.unwrap();

        let (first, _tag) = consumer.recv().await.unwrap();
        // Consumer "crashes" before acking; the broker delivers again
        consumer.redeliver_unacked();

        let (second, tag) = consumer.recv().await.unwrap();
        assert_eq!(first, second);
        consumer.ack(tag).await.unwrap();
        assert_eq!(consumer.unacked(), 0);
    }

    #[tokio::test]
    async fn routing_keys_are_isolated() {
        let bus = MemoryBus::new();
        let parsed = bus.consumer("json.parsed");

        bus.publish_raw("chunks.prepared", json!({"not": "for us"}));
        bus.publish_raw("json.parsed", json!({"for": "us"}));

        let (value, _) = parsed.recv().await.unwrap();
        assert_eq!(value["for"], "us");
    }
}
