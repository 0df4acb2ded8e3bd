use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub trait DomainEvent: Send + Sync + Clone {
    fn event_type(&self) -> &'static str;
    fn entity_id(&self) -> String;
    fn entity_type(&self) -> &'static str;
    /// Per-entity version of the entity after this event was committed.
    fn sequence(&self) -> u64;
    fn occurred_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub entity_id: String,
    pub entity_type: String,
    pub event_type: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub correlation_id: Option<Uuid>,
    pub source: String,
}

impl EventMetadata {
    pub fn from_source(source: &str) -> Self {
        Self {
            correlation_id: None,
            source: source.to_string(),
        }
    }

    pub fn correlated(source: &str, correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            source: source.to_string(),
        }
    }
}

impl EventEnvelope {
    pub fn new<E: DomainEvent + Serialize>(
        event: &E,
        metadata: EventMetadata,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            entity_id: event.entity_id(),
            entity_type: event.entity_type().to_string(),
            event_type: event.event_type().to_string(),
            sequence: event.sequence(),
            payload: serde_json::to_value(event)?,
            metadata,
            occurred_at: event.occurred_at(),
        })
    }

    /// Kafka record key and ordering key.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

/// Outbound port for the event-relay collaborator.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String>;
}
