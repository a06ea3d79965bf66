//! Kafka transport for the event bus.
//!
//! One topic per routing key under a shared prefix
//! (`copilot.events.archive.ingested`, `copilot.events.parsing.failed`, ...),
//! so each stage binds a durable consumer group to exactly the keys it
//! consumes. Offsets are stored manually after the stage acknowledges, which
//! is what turns Kafka's delivery into the at-least-once contract the stages
//! are written against.

use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use health::HealthHandle;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};
use serde_json::Value;
use tracing::{debug, error, info};

use super::{BusError, DeliveryTag, EventBus, EventConsumer};
use crate::envelope::EventEnvelope;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
    pub kafka_hosts: String,
    #[envconfig(default = "copilot.events")]
    pub kafka_topic_prefix: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConsumerConfig {
    #[envconfig(default = "copilot-pipeline")]
    pub kafka_consumer_group: String,
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

pub fn topic_for(prefix: &str, routing_key: &str) -> String {
    format!("{}.{}", prefix, routing_key)
}

struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is alive and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }

        metrics::gauge!("pipeline_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("pipeline_kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

/// Producer half. Shared by every service that publishes envelopes.
pub struct KafkaEventBus {
    producer: FutureProducer<KafkaContext>,
    topic_prefix: String,
}

impl KafkaEventBus {
    pub fn new(config: &KafkaConfig, liveness: Option<HealthHandle>) -> anyhow::Result<Self> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        let _metadata = producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?;
        info!("connected to Kafka brokers");

        Ok(Self {
            producer,
            topic_prefix: config.kafka_topic_prefix.clone(),
        })
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> Result<(), BusError> {
        let topic = topic_for(&self.topic_prefix, routing_key);
        let payload = serde_json::to_string(envelope).map_err(|err| BusError::Publish {
            routing_key: routing_key.to_owned(),
            error: err.to_string(),
        })?;
        let key = envelope.event_id.to_string();

        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic: topic.as_str(),
                payload: Some(&payload),
                partition: None,
                key: Some(key.as_str()),
                timestamp: None,
                headers: None,
            })
            .map_err(|(err, _): (KafkaError, _)| {
                error!("failed to queue event for {}: {}", routing_key, err);
                BusError::Publish {
                    routing_key: routing_key.to_owned(),
                    error: err.to_string(),
                }
            })?;

        match delivery.await {
            Ok(Ok(_)) => {
                metrics::counter!("pipeline_events_published_total", "routing_key" => routing_key.to_owned())
                    .increment(1);
                Ok(())
            }
            Ok(Err((err, _))) => {
                error!("failed to produce event to {}: {}", topic, err);
                Err(BusError::Publish {
                    routing_key: routing_key.to_owned(),
                    error: err.to_string(),
                })
            }
            Err(_) => {
                // Cancelled due to timeout while retrying
                error!("failed to produce to {} before write timeout", topic);
                Err(BusError::Publish {
                    routing_key: routing_key.to_owned(),
                    error: "delivery timed out".to_owned(),
                })
            }
        }
    }
}

/// Consumer half, bound to a single routing key.
pub struct KafkaEventConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventConsumer {
    pub fn new(
        config: &KafkaConfig,
        consumer_config: &KafkaConsumerConfig,
        routing_key: &str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            // Offsets are stored by the stage runner after it acknowledges a
            // delivery, never implicitly on read.
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        let topic = topic_for(&config.kafka_topic_prefix, routing_key);
        consumer.subscribe(&[topic.as_str()])?;

        Ok(Self { consumer, topic })
    }
}

#[async_trait]
impl EventConsumer for KafkaEventConsumer {
    async fn recv(&self) -> Result<(Value, DeliveryTag), BusError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|err| BusError::Receive(err.to_string()))?;

        let tag = DeliveryTag {
            partition: message.partition(),
            offset: message.offset(),
            token: 0,
        };

        let Some(payload) = message.payload() else {
            // Store poison pills so they do not wedge the partition
            self.store(&tag)?;
            return Err(BusError::Malformed("empty payload".to_owned()));
        };

        match serde_json::from_slice(payload) {
            Ok(value) => Ok((value, tag)),
            Err(err) => {
                self.store(&tag)?;
                Err(BusError::Malformed(err.to_string()))
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.store(&tag)
    }
}

impl KafkaEventConsumer {
    fn store(&self, tag: &DeliveryTag) -> Result<(), BusError> {
        self.consumer
            .store_offset(&self.topic, tag.partition, tag.offset)
            .map_err(|err| BusError::Ack(err.to_string()))
    }
}
