use crate::common::{EventEnvelope, EventSink};
use async_trait::async_trait;
use std::sync::Arc;

/// Forwards to a primary sink and, best effort, to a secondary one.
/// Only the primary's outcome decides whether delivery succeeded.
pub struct FanoutEventSink {
    primary: Arc<dyn EventSink>,
    secondary: Option<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(primary: Arc<dyn EventSink>, secondary: Option<Arc<dyn EventSink>>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        self.primary.publish(envelope.clone()).await?;
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.publish(envelope).await {
                tracing::warn!("Secondary event sink failed: {}", e);
            }
        }
        Ok(())
    }
}
