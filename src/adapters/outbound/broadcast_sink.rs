use crate::common::{EventEnvelope, EventSink};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// In-process relay: every envelope goes to all current subscribers.
///
/// Having no subscriber is not an error; envelopes are simply dropped.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(envelope)
            .map(|_| ())
            .map_err(|e| format!("Broadcast failed: {}", e))
    }
}
