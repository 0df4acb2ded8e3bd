use crate::common::{EventEnvelope, EventSink};
use async_trait::async_trait;

/// Writes each event as a structured tracing record. Used when no relay is
/// configured.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        tracing::info!(
            target: "agv_coordinator::events",
            entity = %envelope.partition_key(),
            event = %envelope.event_type,
            sequence = envelope.sequence,
            payload = %envelope.payload,
            "event"
        );
        Ok(())
    }
}
