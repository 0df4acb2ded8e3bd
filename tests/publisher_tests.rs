use agv_coordinator::adapters::outbound::{BroadcastEventSink, FanoutEventSink, InMemoryEventSink};
use agv_coordinator::application::EventPublisher;
use agv_coordinator::domains::tasks::{Priority, Task, TaskEvent, TaskRequest, TaskStatus};
use agv_coordinator::{EventEnvelope, EventSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

fn tasks(n: u64) -> Vec<Task> {
    (0..n)
        .map(|seq| Task::new(TaskRequest::transport("A-01", "B-01", Priority::Normal), seq))
        .collect()
}

/// Holds every hand-off until a permit is released.
struct GatedSink {
    gate: Semaphore,
    calls: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl GatedSink {
    fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventSink for GatedSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|e| e.to_string())?;
        permit.forget();
        self.delivered.lock().await.push(envelope.entity_id);
        Ok(())
    }
}

#[tokio::test]
async fn rejected_events_are_held_and_flushed_in_order() {
    let sink = Arc::new(InMemoryEventSink::new());
    let publisher = EventPublisher::new(sink.clone(), "test");
    let tasks = tasks(3);

    sink.reject_deliveries(true);
    for task in &tasks {
        publisher.publish(&TaskEvent::submitted(task)).await.unwrap();
    }
    assert_eq!(publisher.pending().await, 3);
    assert!(sink.events().await.is_empty());
    assert!(sink.rejected_count() >= 3);

    // Still failing: nothing is lost or reordered.
    assert_eq!(publisher.flush().await, 0);
    assert_eq!(publisher.pending().await, 3);

    sink.reject_deliveries(false);
    assert_eq!(publisher.flush().await, 3);
    assert_eq!(publisher.pending().await, 0);

    let delivered: Vec<String> = sink.events().await.into_iter().map(|e| e.entity_id).collect();
    let expected: Vec<String> = tasks.iter().map(|t| t.id.to_string()).collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn next_publish_drains_the_backlog_first() {
    let sink = Arc::new(InMemoryEventSink::new());
    let publisher = EventPublisher::new(sink.clone(), "test");
    let tasks = tasks(2);

    sink.reject_deliveries(true);
    publisher.publish(&TaskEvent::submitted(&tasks[0])).await.unwrap();
    sink.reject_deliveries(false);
    publisher.publish(&TaskEvent::submitted(&tasks[1])).await.unwrap();

    let events = sink.events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].entity_id, tasks[0].id.to_string());
    assert_eq!(events[1].entity_id, tasks[1].id.to_string());
}

#[tokio::test]
async fn envelope_carries_identity_and_correlation() {
    let sink = Arc::new(InMemoryEventSink::new());
    let publisher = EventPublisher::new(sink.clone(), "coordinator-a");
    let before = tasks(1).remove(0);
    let mut after = before.clone();
    after.transition(TaskStatus::Assigned).unwrap();
    after.version = before.version + 1;

    publisher
        .publish_correlated(&TaskEvent::status_changed(&before, &after), after.id.0)
        .await
        .unwrap();

    let envelope = sink.events().await.remove(0);
    assert_eq!(envelope.entity_type, "Task");
    assert_eq!(envelope.event_type, "TaskStatusChanged");
    assert_eq!(envelope.sequence, after.version);
    assert_eq!(envelope.partition_key(), format!("Task:{}", after.id));
    assert_eq!(envelope.metadata.source, "coordinator-a");
    assert_eq!(envelope.metadata.correlation_id, Some(after.id.0));
    let event: TaskEvent = serde_json::from_value(envelope.payload).unwrap();
    assert!(matches!(event, TaskEvent::StatusChanged { .. }));
}

#[tokio::test]
async fn fanout_reaches_both_sinks_and_reports_primary_failures() {
    let primary = Arc::new(InMemoryEventSink::new());
    let broadcast = Arc::new(BroadcastEventSink::new(16));
    let mut receiver = broadcast.subscribe();
    let fanout = FanoutEventSink::new(primary.clone(), Some(broadcast.clone() as Arc<dyn EventSink>));
    let publisher = EventPublisher::new(Arc::new(fanout), "test");
    let task = tasks(1).remove(0);

    publisher.publish(&TaskEvent::submitted(&task)).await.unwrap();
    assert_eq!(primary.events().await.len(), 1);
    let received = receiver.recv().await.unwrap();
    assert_eq!(received.entity_id, task.id.to_string());

    primary.reject_deliveries(true);
    publisher.publish(&TaskEvent::submitted(&task)).await.unwrap();
    assert_eq!(publisher.pending().await, 1);
}

#[tokio::test]
async fn broadcast_without_subscribers_is_not_an_error() {
    let sink = BroadcastEventSink::new(4);
    let task = tasks(1).remove(0);
    let envelope = agv_coordinator::EventEnvelope::new(
        &TaskEvent::submitted(&task),
        agv_coordinator::EventMetadata::from_source("test"),
    )
    .unwrap();
    assert!(sink.publish(envelope).await.is_ok());
}

#[tokio::test]
async fn slow_sink_does_not_block_other_publishers() {
    let sink = Arc::new(GatedSink::closed());
    let publisher = Arc::new(EventPublisher::new(sink.clone(), "test"));
    let tasks = tasks(2);

    let in_flight = tokio::spawn({
        let publisher = publisher.clone();
        let task = tasks[0].clone();
        async move { publisher.publish(&TaskEvent::submitted(&task)).await }
    });
    while sink.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // The first hand-off is stuck in the sink; this one only queues.
    tokio::time::timeout(
        Duration::from_secs(1),
        publisher.publish(&TaskEvent::submitted(&tasks[1])),
    )
    .await
    .expect("publish waited on the sink")
    .unwrap();
    assert_eq!(publisher.pending().await, 2);

    sink.gate.add_permits(2);
    in_flight.await.unwrap().unwrap();
    assert_eq!(publisher.pending().await, 0);
    let expected: Vec<String> = tasks.iter().map(|t| t.id.to_string()).collect();
    assert_eq!(*sink.delivered.lock().await, expected);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
}
