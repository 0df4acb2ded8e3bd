use super::task::{Priority, Task, TaskId, TaskKind, TaskStatus};
use crate::common::DomainEvent;
use crate::domains::fleet::AgvId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        kind: TaskKind,
        priority: Priority,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
        agv_id: Option<AgvId>,
        reason: Option<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn submitted(task: &Task) -> Self {
        TaskEvent::Submitted {
            task_id: task.id,
            kind: task.kind.clone(),
            priority: task.priority,
            sequence: task.version,
            timestamp: task.created_at,
        }
    }

    pub fn status_changed(before: &Task, after: &Task) -> Self {
        TaskEvent::StatusChanged {
            task_id: after.id,
            old_status: before.status,
            new_status: after.status,
            agv_id: after.assigned_agv.clone(),
            reason: after.failure_reason.clone(),
            sequence: after.version,
            timestamp: Utc::now(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Submitted { task_id, .. } => *task_id,
            TaskEvent::StatusChanged { task_id, .. } => *task_id,
        }
    }
}

impl DomainEvent for TaskEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::Submitted { .. } => "TaskSubmitted",
            TaskEvent::StatusChanged { .. } => "TaskStatusChanged",
        }
    }

    fn entity_id(&self) -> String {
        self.task_id().to_string()
    }

    fn entity_type(&self) -> &'static str {
        "Task"
    }

    fn sequence(&self) -> u64 {
        match self {
            TaskEvent::Submitted { sequence, .. } => *sequence,
            TaskEvent::StatusChanged { sequence, .. } => *sequence,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TaskEvent::Submitted { timestamp, .. } => *timestamp,
            TaskEvent::StatusChanged { timestamp, .. } => *timestamp,
        }
    }
}
