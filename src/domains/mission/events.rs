use super::stage::MissionStage;
use crate::common::DomainEvent;
use crate::domains::fleet::AgvId;
use crate::domains::planning::Step;
use crate::domains::tasks::TaskId;
use crate::domains::world::Cell;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MissionEvent {
    StageChanged {
        task_id: TaskId,
        agv_id: AgvId,
        from: MissionStage,
        to: MissionStage,
        step: Step,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    RouteCommitted {
        task_id: TaskId,
        agv_id: AgvId,
        from: Cell,
        to: Cell,
        departure: Step,
        arrival: Step,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// Fatal outcome, surfaced for operators.
    Failed {
        task_id: TaskId,
        agv_id: AgvId,
        stage: MissionStage,
        reason: String,
        step: Step,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

impl MissionEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            MissionEvent::StageChanged { task_id, .. } => *task_id,
            MissionEvent::RouteCommitted { task_id, .. } => *task_id,
            MissionEvent::Failed { task_id, .. } => *task_id,
        }
    }
}

impl DomainEvent for MissionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MissionEvent::StageChanged { .. } => "MissionStageChanged",
            MissionEvent::RouteCommitted { .. } => "MissionRouteCommitted",
            MissionEvent::Failed { .. } => "MissionFailed",
        }
    }

    fn entity_id(&self) -> String {
        self.task_id().to_string()
    }

    fn entity_type(&self) -> &'static str {
        "Mission"
    }

    fn sequence(&self) -> u64 {
        match self {
            MissionEvent::StageChanged { sequence, .. } => *sequence,
            MissionEvent::RouteCommitted { sequence, .. } => *sequence,
            MissionEvent::Failed { sequence, .. } => *sequence,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MissionEvent::StageChanged { timestamp, .. } => *timestamp,
            MissionEvent::RouteCommitted { timestamp, .. } => *timestamp,
            MissionEvent::Failed { timestamp, .. } => *timestamp,
        }
    }
}
