use crate::common::{EventEnvelope, EventSink};
use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

/// Relays events to a Kafka topic. The record key is the entity's partition
/// key, so every event of one AGV or task lands on the same partition and
/// keeps its order.
pub struct KafkaEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, String> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| format!("Failed to create Kafka producer: {}", e))?;

        tracing::info!(
            "Kafka event sink ready: topic {} on {}",
            config.topic,
            config.brokers.join(",")
        );
        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        let key = envelope.partition_key();
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| format!("Failed to serialize event: {}", e))?;

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map(|_| ())
            .map_err(|(e, _)| format!("Failed to send event to Kafka: {}", e))
    }
}
