use crate::common::{EventEnvelope, EventSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Records every delivered envelope. Delivery can be made to fail to
/// exercise the publisher's retry path.
#[derive(Default)]
pub struct InMemoryEventSink {
    events: RwLock<Vec<EventEnvelope>>,
    reject: AtomicBool,
    rejected: AtomicUsize,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_deliveries(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().await.clone()
    }

    pub async fn events_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Envelopes of one entity in delivery order.
    pub async fn events_for(&self, entity_type: &str, entity_id: &str) -> Vec<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        if self.reject.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(format!("delivery of {} rejected", envelope.event_id));
        }
        self.events.write().await.push(envelope);
        Ok(())
    }
}
