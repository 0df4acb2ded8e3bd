use crate::common::{DomainError, DomainResult};
use crate::domains::fleet::AgvId;
use crate::domains::planning::{Blockage, Conflict, Pathfinder, ReservationTable, Route, Step};
use crate::domains::world::{Cell, WorldMap};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared reservation table plus search-then-commit planning.
///
/// Searches run under the read lock; the result is re-validated and inserted
/// under the write lock. A route that went stale in between is thrown away
/// and searched again.
pub struct RoutePlanner {
    world: Arc<WorldMap>,
    table: RwLock<ReservationTable>,
    horizon: u64,
    commit_attempts: u32,
}

impl RoutePlanner {
    pub fn new(world: Arc<WorldMap>, horizon: u64, commit_attempts: u32) -> Self {
        Self {
            world,
            table: RwLock::new(ReservationTable::new()),
            horizon,
            commit_attempts: commit_attempts.max(1),
        }
    }

    pub async fn plan(
        &self,
        agv_id: &AgvId,
        from: Cell,
        to: Cell,
        start: Step,
    ) -> DomainResult<Route> {
        let pathfinder = Pathfinder::new(&self.world, self.horizon);
        for attempt in 1..=self.commit_attempts {
            let route = {
                let table = self.table.read().await;
                pathfinder.route(agv_id, from, to, start, &table)?
            };
            let mut table = self.table.write().await;
            match table.commit(&route) {
                Ok(()) => return Ok(route),
                Err(DomainError::ReservationConflict { cell, step, .. }) => {
                    tracing::warn!(
                        "Route for {} went stale at {} step {} (attempt {}/{})",
                        agv_id,
                        cell,
                        step,
                        attempt,
                        self.commit_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(DomainError::NoPath {
            from,
            to,
            horizon: self.horizon,
        })
    }

    /// Parked AGVs standing between `from` and `to`.
    pub async fn blockage(&self, agv_id: &AgvId, from: Cell, to: Cell) -> Option<Blockage> {
        let table = self.table.read().await;
        Pathfinder::new(&self.world, self.horizon).blockage(agv_id, from, to, &table)
    }

    pub async fn holding_cell(
        &self,
        agv_id: &AgvId,
        from: Cell,
        keep_clear: &[Cell],
        taken: &BTreeSet<Cell>,
    ) -> Option<Cell> {
        let table = self.table.read().await;
        Pathfinder::new(&self.world, self.horizon).holding_cell(agv_id, from, keep_clear, taken, &table)
    }

    pub async fn park(&self, agv_id: &AgvId, cell: Cell, from: Step) {
        self.table.write().await.park(agv_id, cell, from);
    }

    pub async fn release(&self, agv_id: &AgvId, cell: Cell, now: Step) {
        self.table.write().await.release_agv(agv_id, cell, now);
    }

    pub async fn quarantine(&self, agv_id: &AgvId, cell: Cell) {
        self.table.write().await.quarantine(agv_id, cell);
    }

    pub async fn is_blocked(&self, agv_id: &AgvId, cell: Cell, step: Step) -> bool {
        self.table.read().await.is_blocked(agv_id, cell, step)
    }

    pub async fn prune_before(&self, step: Step) {
        self.table.write().await.prune_before(step);
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.table.read().await.conflicts()
    }

    pub async fn snapshot(&self) -> ReservationTable {
        self.table.read().await.clone()
    }

    /// Apply a hand-crafted change, used to seed external blockages.
    pub async fn with_table<R>(&self, f: impl FnOnce(&mut ReservationTable) -> R) -> R {
        f(&mut *self.table.write().await)
    }
}
