//! Access-log events and their journey through Kafka.
//!
//! One [`AccessLogEvent`] is published per inbound request, regardless of
//! outcome. Messages are keyed by client IP so all events from the same
//! client land on one partition and a consumer observes them in arrival
//! order. Publishing is fire-and-forget: the enqueue never blocks the
//! request task, and delivery failures surface only as WARN logs —
//! access logging must never degrade the proxy.
//!
//! The consumer side runs in its own consumer group starting from the
//! latest offset (a live dashboard has no use for historical replay) and
//! hands each event to the [`crate::event_stream`] registry.

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::event_stream::SseRegistry;

/// Immutable snapshot of a single request that passed through the gateway.
///
/// `target_url` is `None` when no route matched the incoming path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub target_url: Option<String>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub rate_limited: bool,
}

/// Destination for access-log events. The call must not block the request
/// path waiting for acknowledgement.
pub trait AccessLogSink: Send + Sync {
    fn publish(&self, event: AccessLogEvent);
}

/// Kafka-backed [`AccessLogSink`].
pub struct KafkaAccessLogPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaAccessLogPublisher {
    pub fn new(config: &GatewayConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: config.access_log_topic.clone(),
        })
    }
}

impl AccessLogSink for KafkaAccessLogPublisher {
    fn publish(&self, event: AccessLogEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize access log event");
                return;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(&event.client_ip)
            .payload(&payload);

        // send_result only enqueues into the producer's local buffer; the
        // broker acknowledgement is observed by a detached task.
        match self.producer.send_result(record) {
            Ok(delivery) => {
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Err((e, _message))) => {
                            warn!(error = %e, "access log publish failed");
                        }
                        Err(_cancelled) => {
                            warn!("access log delivery result dropped before completion");
                        }
                        Ok(Ok(_)) => {}
                    }
                });
            }
            Err((e, _record)) => {
                warn!(error = %e, "access log enqueue failed");
            }
        }
    }
}

/// Spawn the consumer loop feeding the live event stream.
///
/// Uses an independent consumer group with `auto.offset.reset = latest`,
/// so only events published after startup are seen. The task exits when
/// the shutdown token is cancelled.
pub fn spawn_consumer(
    config: &GatewayConfig,
    registry: Arc<SseRegistry>,
    shutdown: CancellationToken,
) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", "latest")
        .set("enable.partition.eof", "false")
        .create()?;
    consumer.subscribe(&[&config.access_log_topic])?;

    let topic = config.access_log_topic.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("access log consumer shutting down");
                    break;
                }
                message = consumer.recv() => {
                    match message {
                        Ok(message) => {
                            let Some(payload) = message.payload() else {
                                continue;
                            };
                            match serde_json::from_slice::<AccessLogEvent>(payload) {
                                Ok(event) => registry.broadcast(&event),
                                Err(e) => {
                                    warn!(topic = %topic, error = %e, "dropping undecodable access log message");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "kafka consume error");
                        }
                    }
                }
            }
        }
    });

    Ok(())
}
