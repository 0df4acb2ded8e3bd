use crate::common::{DomainError, DomainResult};
use crate::domains::fleet::AgvId;
use crate::domains::world::{Cell, LocationId, WorldMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service tiers, lowest first. `Charge` is reserved for work the
/// coordinator creates itself: charging and clearing the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Charge,
}

impl Priority {
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
            Priority::Charge => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Transport {
        pickup: LocationId,
        dropoff: LocationId,
    },
    Charge {
        agv_id: AgvId,
        station: Cell,
    },
    /// Move an idle AGV off a cell another mission needs.
    Reposition {
        agv_id: AgvId,
        target: Cell,
    },
}

impl TaskKind {
    pub fn is_charge(&self) -> bool {
        matches!(self, TaskKind::Charge { .. })
    }

    /// The AGV a coordinator-created task must run on.
    pub fn bound_agv(&self) -> Option<&AgvId> {
        match self {
            TaskKind::Charge { agv_id, .. } | TaskKind::Reposition { agv_id, .. } => Some(agv_id),
            TaskKind::Transport { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Transport { .. } => "transport",
            TaskKind::Charge { .. } => "charge",
            TaskKind::Reposition { .. } => "reposition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    EnRoute,
    AtPickup,
    Loaded,
    EnRouteDropoff,
    Charging,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Physically committed: the load is on the forks.
    pub fn is_loaded(&self) -> bool {
        matches!(self, TaskStatus::Loaded | TaskStatus::EnRouteDropoff)
    }

    /// Edges of the task lifecycle graph.
    pub fn can_transition(&self, kind: &TaskKind, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match to {
            Failed => true,
            Cancelled => matches!(self, Pending | Assigned | EnRoute | AtPickup),
            _ => match (kind, *self, to) {
                (_, Pending, Assigned) | (_, Assigned, EnRoute) => true,
                (TaskKind::Transport { .. }, EnRoute, AtPickup)
                | (TaskKind::Transport { .. }, AtPickup, Loaded)
                | (TaskKind::Transport { .. }, Loaded, EnRouteDropoff)
                | (TaskKind::Transport { .. }, EnRouteDropoff, Completed) => true,
                (TaskKind::Charge { .. }, EnRoute, Charging)
                | (TaskKind::Charge { .. }, Charging, Completed) => true,
                (TaskKind::Reposition { .. }, EnRoute, Completed) => true,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::EnRoute => "en_route",
            TaskStatus::AtPickup => "at_pickup",
            TaskStatus::Loaded => "loaded",
            TaskStatus::EnRouteDropoff => "en_route_dropoff",
            TaskStatus::Charging => "charging",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Intake form of a task, before the queue assigns identity and arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub priority: Priority,
}

impl TaskRequest {
    pub fn transport(pickup: impl Into<String>, dropoff: impl Into<String>, priority: Priority) -> Self {
        Self {
            kind: TaskKind::Transport {
                pickup: LocationId::new(pickup),
                dropoff: LocationId::new(dropoff),
            },
            priority,
        }
    }

    pub fn charge(agv_id: AgvId, station: Cell) -> Self {
        Self {
            kind: TaskKind::Charge { agv_id, station },
            priority: Priority::Charge,
        }
    }

    pub fn reposition(agv_id: AgvId, target: Cell) -> Self {
        Self {
            kind: TaskKind::Reposition { agv_id, target },
            priority: Priority::Charge,
        }
    }

    /// Reject malformed submissions before they reach the queue.
    pub fn validate(&self, world: &WorldMap) -> DomainResult<()> {
        match &self.kind {
            TaskKind::Transport { pickup, dropoff } => {
                if self.priority == Priority::Charge {
                    return Err(DomainError::invalid_task(
                        "the charge priority tier is reserved for coordinator tasks",
                    ));
                }
                let pickup_loc = world.location(pickup).ok_or_else(|| {
                    DomainError::invalid_task(format!("unknown pickup location {}", pickup))
                })?;
                let dropoff_loc = world.location(dropoff).ok_or_else(|| {
                    DomainError::invalid_task(format!("unknown dropoff location {}", dropoff))
                })?;
                if pickup == dropoff || pickup_loc.cell == dropoff_loc.cell {
                    return Err(DomainError::invalid_task(
                        "pickup and dropoff locations are identical",
                    ));
                }
                if !world.is_reachable(pickup_loc.cell, dropoff_loc.cell) {
                    return Err(DomainError::invalid_task(format!(
                        "dropoff {} is unreachable from pickup {}",
                        dropoff, pickup
                    )));
                }
                Ok(())
            }
            TaskKind::Charge { station, .. } => {
                if !world.is_charging_station(*station) {
                    return Err(DomainError::invalid_task(format!(
                        "{} is not a charging station",
                        station
                    )));
                }
                Ok(())
            }
            TaskKind::Reposition { target, .. } => {
                if !world.is_traversable(*target) {
                    return Err(DomainError::invalid_task(format!(
                        "{} is not a traversable cell",
                        target
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Arrival order within the queue.
    pub seq: u64,
    pub kind: TaskKind,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agv: Option<AgvId>,
    pub failure_reason: Option<String>,
    /// Set by a cancel request that the owning mission has not observed yet.
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Task {
    pub fn new(request: TaskRequest, seq: u64) -> Self {
        Self {
            id: TaskId::new(),
            seq,
            kind: request.kind,
            priority: request.priority,
            status: TaskStatus::Pending,
            assigned_agv: None,
            failure_reason: None,
            abort_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, to: TaskStatus) -> DomainResult<()> {
        if !self.status.can_transition(&self.kind, to) {
            return Err(DomainError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == TaskStatus::EnRoute && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to == TaskStatus::Completed {
            self.completed_at = Some(now);
        }
        if to.is_terminal() {
            self.abort_requested = false;
        }
        self.status = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Cell the AGV must reach first: the pickup slot, the charger or the
    /// holding cell.
    pub fn first_target(&self, world: &WorldMap) -> Option<Cell> {
        match &self.kind {
            TaskKind::Transport { pickup, .. } => world.location(pickup).map(|l| l.cell),
            TaskKind::Charge { station, .. } => Some(*station),
            TaskKind::Reposition { target, .. } => Some(*target),
        }
    }

    pub fn dropoff_cell(&self, world: &WorldMap) -> Option<Cell> {
        match &self.kind {
            TaskKind::Transport { dropoff, .. } => world.location(dropoff).map(|l| l.cell),
            TaskKind::Charge { .. } | TaskKind::Reposition { .. } => None,
        }
    }
}
