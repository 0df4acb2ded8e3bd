use crate::domains::fleet::AgvId;
use crate::domains::world::Cell;
use serde::{Deserialize, Serialize};

/// Discrete coordinator time.
pub type Step = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Waypoint {
    pub cell: Cell,
    pub step: Step,
}

impl Waypoint {
    pub fn new(cell: Cell, step: Step) -> Self {
        Self { cell, step }
    }
}

/// A timed path: one waypoint per step, starting where the AGV stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub agv_id: AgvId,
    pub waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(agv_id: AgvId, waypoints: Vec<Waypoint>) -> Self {
        Self { agv_id, waypoints }
    }

    pub fn start(&self) -> Option<Waypoint> {
        self.waypoints.first().copied()
    }

    pub fn goal(&self) -> Option<Waypoint> {
        self.waypoints.last().copied()
    }

    pub fn arrival_step(&self) -> Option<Step> {
        self.goal().map(|w| w.step)
    }

    /// Number of steps the route spans, waits included.
    pub fn duration(&self) -> u64 {
        match (self.start(), self.goal()) {
            (Some(s), Some(g)) => g.step - s.step,
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Waypoints strictly after `step`.
    pub fn after(&self, step: Step) -> impl Iterator<Item = &Waypoint> {
        self.waypoints.iter().filter(move |w| w.step > step)
    }

    pub fn cell_at(&self, step: Step) -> Option<Cell> {
        self.waypoints
            .iter()
            .find(|w| w.step == step)
            .map(|w| w.cell)
    }
}
