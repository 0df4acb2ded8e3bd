use crate::common::{ApplicationResult, DomainError, DomainEvent, EventEnvelope, EventMetadata, EventSink};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Ordered, at-least-once delivery to the event sink.
///
/// Envelopes are queued in an outbox and handed to the sink strictly in
/// queue order. A failed hand-off stays at the head of the outbox and is
/// retried before anything queued after it.
///
/// The outbox lock is only held to push or pop. One caller at a time holds
/// the delivery turn and talks to the sink; a publish that finds the turn
/// taken leaves its envelope for the current holder and returns.
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    source: String,
    outbox: Mutex<VecDeque<EventEnvelope>>,
    delivery: Mutex<()>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, source: impl Into<String>) -> Self {
        Self {
            sink,
            source: source.into(),
            outbox: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
        }
    }

    pub async fn publish<E: DomainEvent + Serialize>(&self, event: &E) -> ApplicationResult<()> {
        self.enqueue(event, EventMetadata::from_source(&self.source))
            .await
    }

    /// Publish with a correlation id, typically the task the event belongs to.
    pub async fn publish_correlated<E: DomainEvent + Serialize>(
        &self,
        event: &E,
        correlation_id: Uuid,
    ) -> ApplicationResult<()> {
        self.enqueue(event, EventMetadata::correlated(&self.source, correlation_id))
            .await
    }

    async fn enqueue<E: DomainEvent + Serialize>(
        &self,
        event: &E,
        metadata: EventMetadata,
    ) -> ApplicationResult<()> {
        let envelope = EventEnvelope::new(event, metadata).map_err(DomainError::from)?;
        self.outbox.lock().await.push_back(envelope);
        self.deliver().await;
        Ok(())
    }

    /// Retry everything still in the outbox, waiting for the delivery turn
    /// if another caller holds it. Returns the number delivered.
    pub async fn flush(&self) -> usize {
        let _turn = self.delivery.lock().await;
        self.drain().await.0
    }

    pub async fn pending(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Drain if nobody else is. Envelopes pushed while the holder was
    /// releasing its turn are picked up by checking the outbox once more.
    async fn deliver(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Ok(turn) = self.delivery.try_lock() else {
                return delivered;
            };
            let (count, stalled) = self.drain().await;
            delivered += count;
            drop(turn);
            if stalled || self.outbox.lock().await.is_empty() {
                return delivered;
            }
        }
    }

    /// Hand envelopes to the sink until the outbox is empty or the sink
    /// refuses one. Callers hold the delivery turn, so the head cannot be
    /// popped by anyone else between the hand-off and the pop.
    async fn drain(&self) -> (usize, bool) {
        let mut delivered = 0;
        loop {
            let head = self.outbox.lock().await.front().cloned();
            let Some(envelope) = head else {
                return (delivered, false);
            };
            match self.sink.publish(envelope.clone()).await {
                Ok(()) => {
                    self.outbox.lock().await.pop_front();
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Event sink rejected {} for {}; {} envelope(s) held for retry: {}",
                        envelope.event_type,
                        envelope.partition_key(),
                        self.pending().await,
                        e
                    );
                    return (delivered, true);
                }
            }
        }
    }
}
