use super::route::{Route, Step};
use crate::common::{DomainError, DomainResult};
use crate::domains::fleet::AgvId;
use crate::domains::world::Cell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Open-ended claim of a standing AGV on its cell, from `from` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Park {
    pub cell: Cell,
    pub from: Step,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Two AGVs hold the same cell at the same step.
    Vertex {
        cell: Cell,
        step: Step,
        first: AgvId,
        second: AgvId,
    },
    /// Two AGVs exchange cells between `step - 1` and `step`.
    Swap {
        step: Step,
        first: AgvId,
        second: AgvId,
        cells: (Cell, Cell),
    },
    /// A step claim lands on a static obstacle.
    Obstacle { agv_id: AgvId, cell: Cell, step: Step },
}

/// Space-time claims of the fleet.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    by_cell: HashMap<Cell, BTreeMap<Step, AgvId>>,
    by_agv: HashMap<AgvId, BTreeMap<Step, Cell>>,
    parks: BTreeMap<AgvId, Park>,
    obstacles: BTreeSet<Cell>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claimant(&self, cell: Cell, step: Step) -> Option<&AgvId> {
        self.by_cell.get(&cell).and_then(|steps| steps.get(&step))
    }

    pub fn park_of(&self, agv_id: &AgvId) -> Option<Park> {
        self.parks.get(agv_id).copied()
    }

    /// Another AGV parked on `cell`, regardless of when its park begins.
    pub fn parked_by_other(&self, agv_id: &AgvId, cell: Cell) -> Option<(&AgvId, Park)> {
        self.parks
            .iter()
            .find(|(id, park)| *id != agv_id && park.cell == cell)
            .map(|(id, park)| (id, *park))
    }

    pub fn is_obstacle(&self, cell: Cell) -> bool {
        self.obstacles.contains(&cell)
    }

    /// Whether `agv_id` may occupy `cell` at `step`.
    pub fn is_blocked(&self, agv_id: &AgvId, cell: Cell, step: Step) -> bool {
        if self.is_obstacle(cell) {
            return true;
        }
        if let Some((_, park)) = self.parked_by_other(agv_id, cell) {
            if park.from <= step {
                return true;
            }
        }
        matches!(self.claimant(cell, step), Some(other) if other != agv_id)
    }

    /// Moving `from -> to` arriving at `step` would cross another AGV head on.
    pub fn is_swap(&self, agv_id: &AgvId, from: Cell, to: Cell, step: Step) -> bool {
        if from == to || step == 0 {
            return false;
        }
        match (self.claimant(to, step - 1), self.claimant(from, step)) {
            (Some(a), Some(b)) => a == b && a != agv_id,
            _ => false,
        }
    }

    /// First step at which `agv_id` may arrive at `cell` and stay there.
    pub fn earliest_safe_arrival(&self, agv_id: &AgvId, cell: Cell) -> Step {
        self.by_cell
            .get(&cell)
            .and_then(|steps| {
                steps
                    .iter()
                    .rev()
                    .find(|(_, owner)| *owner != agv_id)
                    .map(|(step, _)| step + 1)
            })
            .unwrap_or(0)
    }

    /// Step claims currently held by `agv_id`, in time order.
    pub fn claims_of(&self, agv_id: &AgvId) -> Vec<(Step, Cell)> {
        self.by_agv
            .get(agv_id)
            .map(|steps| steps.iter().map(|(s, c)| (*s, *c)).collect())
            .unwrap_or_default()
    }

    /// Standing claim for an AGV at rest. Replaces any previous park.
    pub fn park(&mut self, agv_id: &AgvId, cell: Cell, from: Step) {
        self.parks.insert(agv_id.clone(), Park { cell, from });
    }

    /// Re-check `route` against the current table and insert it. Replaces the
    /// AGV's remaining claims and moves its park to the route's goal.
    pub fn commit(&mut self, route: &Route) -> DomainResult<()> {
        let agv_id = &route.agv_id;
        let (start, goal) = match (route.start(), route.goal()) {
            (Some(s), Some(g)) => (s, g),
            _ => {
                return Err(DomainError::InfrastructureError(format!(
                    "empty route for AGV {}",
                    agv_id
                )))
            }
        };
        let mut previous = start;
        for waypoint in &route.waypoints {
            let conflict = self.is_blocked(agv_id, waypoint.cell, waypoint.step)
                || (waypoint.step > start.step
                    && self.is_swap(agv_id, previous.cell, waypoint.cell, waypoint.step));
            if conflict {
                return Err(DomainError::ReservationConflict {
                    agv_id: agv_id.clone(),
                    cell: waypoint.cell,
                    step: waypoint.step,
                });
            }
            previous = *waypoint;
        }
        if goal.step < self.earliest_safe_arrival(agv_id, goal.cell)
            || self.parked_by_other(agv_id, goal.cell).is_some()
        {
            return Err(DomainError::ReservationConflict {
                agv_id: agv_id.clone(),
                cell: goal.cell,
                step: goal.step,
            });
        }

        self.drop_claims(agv_id);
        for waypoint in &route.waypoints {
            self.insert_claim(agv_id, waypoint.cell, waypoint.step);
        }
        self.park(agv_id, goal.cell, goal.step);
        Ok(())
    }

    /// Abandon the AGV's planned claims and park it where it stands.
    pub fn release_agv(&mut self, agv_id: &AgvId, cell: Cell, now: Step) {
        self.drop_claims(agv_id);
        self.park(agv_id, cell, now);
    }

    /// Turn a faulted AGV into a static obstacle at `cell`.
    pub fn quarantine(&mut self, agv_id: &AgvId, cell: Cell) {
        self.drop_claims(agv_id);
        self.parks.remove(agv_id);
        self.obstacles.insert(cell);
    }

    /// Forget step claims that lie in the past.
    pub fn prune_before(&mut self, step: Step) {
        for steps in self.by_cell.values_mut() {
            *steps = steps.split_off(&step);
        }
        self.by_cell.retain(|_, steps| !steps.is_empty());
        for steps in self.by_agv.values_mut() {
            *steps = steps.split_off(&step);
        }
        self.by_agv.retain(|_, steps| !steps.is_empty());
    }

    /// Every vertex, swap or obstacle conflict present in the table.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut found = Vec::new();
        for (agv_id, steps) in &self.by_agv {
            for (&step, &cell) in steps {
                if self.is_obstacle(cell) {
                    found.push(Conflict::Obstacle {
                        agv_id: agv_id.clone(),
                        cell,
                        step,
                    });
                }
                if let Some((other, park)) = self.parked_by_other(agv_id, cell) {
                    if park.from <= step {
                        found.push(Conflict::Vertex {
                            cell,
                            step,
                            first: other.clone(),
                            second: agv_id.clone(),
                        });
                    }
                }
                if self.claimant(cell, step) != Some(agv_id) {
                    if let Some(other) = self.claimant(cell, step) {
                        found.push(Conflict::Vertex {
                            cell,
                            step,
                            first: other.clone(),
                            second: agv_id.clone(),
                        });
                    }
                }
                if let Some(&prev) = step.checked_sub(1).and_then(|p| steps.get(&p)) {
                    if prev != cell && self.is_swap(agv_id, prev, cell, step) {
                        if let Some(other) = self.claimant(prev, step) {
                            if agv_id < other {
                                found.push(Conflict::Swap {
                                    step,
                                    first: agv_id.clone(),
                                    second: other.clone(),
                                    cells: (prev, cell),
                                });
                            }
                        }
                    }
                }
            }
        }
        let parks: Vec<(&AgvId, &Park)> = self.parks.iter().collect();
        for (i, (a, pa)) in parks.iter().enumerate() {
            for (b, pb) in parks.iter().skip(i + 1) {
                if pa.cell == pb.cell {
                    found.push(Conflict::Vertex {
                        cell: pa.cell,
                        step: pa.from.max(pb.from),
                        first: (*a).clone(),
                        second: (*b).clone(),
                    });
                }
            }
        }
        found
    }

    fn insert_claim(&mut self, agv_id: &AgvId, cell: Cell, step: Step) {
        self.by_cell
            .entry(cell)
            .or_default()
            .insert(step, agv_id.clone());
        self.by_agv
            .entry(agv_id.clone())
            .or_default()
            .insert(step, cell);
    }

    fn drop_claims(&mut self, agv_id: &AgvId) {
        if let Some(steps) = self.by_agv.remove(agv_id) {
            for (step, cell) in steps {
                if let Some(cell_steps) = self.by_cell.get_mut(&cell) {
                    if cell_steps.get(&step) == Some(agv_id) {
                        cell_steps.remove(&step);
                    }
                    if cell_steps.is_empty() {
                        self.by_cell.remove(&cell);
                    }
                }
            }
        }
    }
}
