use crate::domains::tasks::TaskId;
use crate::domains::world::{Cell, Position2D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgvId(pub String);

impl AgvId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgvId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgvStatus {
    Idle,
    Moving,
    Charging,
    ExecutingMission,
    Faulted,
}

impl AgvStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgvStatus::Idle => "idle",
            AgvStatus::Moving => "moving",
            AgvStatus::Charging => "charging",
            AgvStatus::ExecutingMission => "executing_mission",
            AgvStatus::Faulted => "faulted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(AgvStatus::Idle),
            "moving" => Some(AgvStatus::Moving),
            "charging" => Some(AgvStatus::Charging),
            "executing_mission" => Some(AgvStatus::ExecutingMission),
            "faulted" => Some(AgvStatus::Faulted),
            _ => None,
        }
    }
}

/// Grid heading. North is decreasing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heading {
    North,
    East,
    South,
    West,
}

impl Heading {
    /// Heading of a single-cell move, `None` for a wait or a non-adjacent jump.
    pub fn between(from: Cell, to: Cell) -> Option<Heading> {
        if !from.is_adjacent(&to) {
            return None;
        }
        Some(if to.row < from.row {
            Heading::North
        } else if to.row > from.row {
            Heading::South
        } else if to.bay > from.bay {
            Heading::East
        } else {
            Heading::West
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agv {
    pub id: AgvId,
    pub cell: Cell,
    pub position: Position2D,
    pub heading: Heading,
    /// Percent, 0–100.
    pub battery: f64,
    pub status: AgvStatus,
    pub current_task_id: Option<TaskId>,
    pub fault_reason: Option<String>,
    pub speed_mps: f64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Agv {
    pub fn new(id: AgvId, cell: Cell, position: Position2D, battery: f64) -> Self {
        Self {
            id,
            cell,
            position,
            heading: Heading::East,
            battery: battery.clamp(0.0, 100.0),
            status: AgvStatus::Idle,
            current_task_id: None,
            fault_reason: None,
            speed_mps: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgvStatus::Idle && self.current_task_id.is_none()
    }

    pub fn is_faulted(&self) -> bool {
        self.status == AgvStatus::Faulted
    }

    /// Lower the battery. Ignored while charging so the level never drops
    /// on a charger.
    pub fn drain(&mut self, amount: f64) {
        if self.status == AgvStatus::Charging || amount <= 0.0 {
            return;
        }
        self.battery = (self.battery - amount).max(0.0);
    }

    /// Raise the battery. Only applies while charging.
    pub fn charge(&mut self, amount: f64) {
        if self.status != AgvStatus::Charging || amount <= 0.0 {
            return;
        }
        self.battery = (self.battery + amount).min(100.0);
    }

    pub fn is_depleted(&self) -> bool {
        self.battery <= 0.0
    }

    /// Move one step. Waiting in place keeps the heading.
    pub fn move_to(&mut self, cell: Cell, position: Position2D) {
        if let Some(heading) = Heading::between(self.cell, cell) {
            self.heading = heading;
        }
        self.cell = cell;
        self.position = position;
    }
}
