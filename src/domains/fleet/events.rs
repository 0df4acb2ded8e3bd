use super::agv::{Agv, AgvId, AgvStatus, Heading};
use crate::common::DomainEvent;
use crate::domains::tasks::TaskId;
use crate::domains::world::{Cell, Position2D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgvEvent {
    Moved {
        agv_id: AgvId,
        from: Cell,
        to: Cell,
        position: Position2D,
        heading: Heading,
        battery: f64,
        step: u64,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        agv_id: AgvId,
        old_status: AgvStatus,
        new_status: AgvStatus,
        cell: Cell,
        battery: f64,
        task_id: Option<TaskId>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    BatteryChanged {
        agv_id: AgvId,
        battery: f64,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    Faulted {
        agv_id: AgvId,
        cell: Cell,
        reason: String,
        task_id: Option<TaskId>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

impl AgvEvent {
    pub fn moved(agv: &Agv, from: Cell, step: u64) -> Self {
        AgvEvent::Moved {
            agv_id: agv.id.clone(),
            from,
            to: agv.cell,
            position: agv.position,
            heading: agv.heading,
            battery: agv.battery,
            step,
            sequence: agv.version,
            timestamp: agv.updated_at,
        }
    }

    pub fn status_changed(before: &Agv, after: &Agv) -> Self {
        AgvEvent::StatusChanged {
            agv_id: after.id.clone(),
            old_status: before.status,
            new_status: after.status,
            cell: after.cell,
            battery: after.battery,
            task_id: after.current_task_id.or(before.current_task_id),
            sequence: after.version,
            timestamp: after.updated_at,
        }
    }

    pub fn battery_changed(agv: &Agv) -> Self {
        AgvEvent::BatteryChanged {
            agv_id: agv.id.clone(),
            battery: agv.battery,
            sequence: agv.version,
            timestamp: agv.updated_at,
        }
    }

    pub fn faulted(agv: &Agv, task_id: Option<TaskId>) -> Self {
        AgvEvent::Faulted {
            agv_id: agv.id.clone(),
            cell: agv.cell,
            reason: agv.fault_reason.clone().unwrap_or_default(),
            task_id,
            sequence: agv.version,
            timestamp: agv.updated_at,
        }
    }

    pub fn agv_id(&self) -> &AgvId {
        match self {
            AgvEvent::Moved { agv_id, .. } => agv_id,
            AgvEvent::StatusChanged { agv_id, .. } => agv_id,
            AgvEvent::BatteryChanged { agv_id, .. } => agv_id,
            AgvEvent::Faulted { agv_id, .. } => agv_id,
        }
    }
}

impl DomainEvent for AgvEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AgvEvent::Moved { .. } => "AgvMoved",
            AgvEvent::StatusChanged { .. } => "AgvStatusChanged",
            AgvEvent::BatteryChanged { .. } => "AgvBatteryChanged",
            AgvEvent::Faulted { .. } => "AgvFaulted",
        }
    }

    fn entity_id(&self) -> String {
        self.agv_id().to_string()
    }

    fn entity_type(&self) -> &'static str {
        "Agv"
    }

    fn sequence(&self) -> u64 {
        match self {
            AgvEvent::Moved { sequence, .. } => *sequence,
            AgvEvent::StatusChanged { sequence, .. } => *sequence,
            AgvEvent::BatteryChanged { sequence, .. } => *sequence,
            AgvEvent::Faulted { sequence, .. } => *sequence,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AgvEvent::Moved { timestamp, .. } => *timestamp,
            AgvEvent::StatusChanged { timestamp, .. } => *timestamp,
            AgvEvent::BatteryChanged { timestamp, .. } => *timestamp,
            AgvEvent::Faulted { timestamp, .. } => *timestamp,
        }
    }
}
