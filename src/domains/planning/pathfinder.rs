use super::reservation::ReservationTable;
use super::route::{Route, Step, Waypoint};
use crate::common::{DomainError, DomainResult};
use crate::domains::fleet::AgvId;
use crate::domains::world::{Cell, WorldMap};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

type Node = (Cell, Step);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frontier {
    f_cost: u64,
    cell: Cell,
    step: Step,
}

// Min-heap on f; deeper nodes first on ties, then cell order for determinism.
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f_cost
            .cmp(&self.f_cost)
            .then_with(|| self.step.cmp(&other.step))
            .then_with(|| other.cell.cmp(&self.cell))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome statistics of the last search, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub nodes_expanded: usize,
}

/// Cheapest static way to a goal, ignoring timed claims, and the AGVs
/// parked on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blockage {
    /// Cells from start to goal, both included.
    pub path: Vec<Cell>,
    /// Parked AGVs standing on `path`, nearest first.
    pub parked: Vec<AgvId>,
}

/// Time-expanded A* over `(cell, step)` with unit moves and unit waits.
pub struct Pathfinder<'a> {
    world: &'a WorldMap,
    horizon: u64,
}

impl<'a> Pathfinder<'a> {
    pub fn new(world: &'a WorldMap, horizon: u64) -> Self {
        Self { world, horizon }
    }

    pub fn route(
        &self,
        agv_id: &AgvId,
        from: Cell,
        to: Cell,
        start: Step,
        reservations: &ReservationTable,
    ) -> DomainResult<Route> {
        self.route_with_stats(agv_id, from, to, start, reservations)
            .map(|(route, _)| route)
    }

    /// Shortest conflict-free timed path from `from` at `start` to `to`,
    /// arriving at a step after which nobody else claims `to`.
    pub fn route_with_stats(
        &self,
        agv_id: &AgvId,
        from: Cell,
        to: Cell,
        start: Step,
        reservations: &ReservationTable,
    ) -> DomainResult<(Route, SearchStats)> {
        let no_path = || DomainError::NoPath {
            from,
            to,
            horizon: self.horizon,
        };

        if !self.world.is_reachable(from, to) {
            tracing::debug!("[Pathfinder] {} -> {} statically unreachable", from, to);
            return Err(no_path());
        }
        if reservations.is_obstacle(to) {
            tracing::debug!("[Pathfinder] goal {} is an obstacle", to);
            return Err(no_path());
        }
        if let Some((holder, _)) = reservations.parked_by_other(agv_id, to) {
            tracing::debug!("[Pathfinder] goal {} is held by parked {}", to, holder);
            return Err(DomainError::GoalOccupied {
                cell: to,
                agv_id: holder.clone(),
            });
        }

        let earliest_arrival = reservations.earliest_safe_arrival(agv_id, to).max(start);
        let deadline = start.saturating_add(self.horizon);
        if earliest_arrival > deadline {
            return Err(no_path());
        }
        let heuristic = |cell: Cell, step: Step| -> u64 {
            cell.manhattan(&to).max(earliest_arrival.saturating_sub(step))
        };

        let mut open_set = BinaryHeap::new();
        let mut closed_set: HashSet<Node> = HashSet::new();
        let mut came_from: HashMap<Node, Node> = HashMap::new();
        let mut stats = SearchStats::default();

        open_set.push(Frontier {
            f_cost: heuristic(from, start),
            cell: from,
            step: start,
        });

        while let Some(current) = open_set.pop() {
            let node = (current.cell, current.step);
            if !closed_set.insert(node) {
                continue;
            }
            stats.nodes_expanded += 1;

            if current.cell == to && current.step >= earliest_arrival {
                let route = Route::new(agv_id.clone(), Self::reconstruct(&came_from, node));
                tracing::debug!(
                    "[Pathfinder] {} {} -> {}: {} steps, {} nodes",
                    agv_id,
                    from,
                    to,
                    route.duration(),
                    stats.nodes_expanded
                );
                return Ok((route, stats));
            }
            if current.step >= deadline {
                continue;
            }

            let next_step = current.step + 1;
            let successors = std::iter::once(current.cell).chain(self.world.neighbors(current.cell));
            for next in successors {
                let next_node = (next, next_step);
                if closed_set.contains(&next_node) {
                    continue;
                }
                if reservations.is_blocked(agv_id, next, next_step)
                    || reservations.is_swap(agv_id, current.cell, next, next_step)
                {
                    continue;
                }
                if came_from.contains_key(&next_node) {
                    // Every edge costs one step, so the first parent is optimal.
                    continue;
                }
                came_from.insert(next_node, node);
                open_set.push(Frontier {
                    f_cost: (next_step - start) + heuristic(next, next_step),
                    cell: next,
                    step: next_step,
                });
            }
        }

        tracing::debug!(
            "[Pathfinder] NoPath {} -> {} for {} after expanding {} nodes",
            from,
            to,
            agv_id,
            stats.nodes_expanded
        );
        Err(no_path())
    }

    /// Dijkstra over the static grid where each cell parked by another AGV
    /// costs one blocker. Obstacles are walls. `None` if `to` is walled off.
    pub fn blockage(
        &self,
        agv_id: &AgvId,
        from: Cell,
        to: Cell,
        reservations: &ReservationTable,
    ) -> Option<Blockage> {
        if !self.world.is_reachable(from, to) || reservations.is_obstacle(to) {
            return None;
        }
        let mut best: HashMap<Cell, (usize, u64)> = HashMap::new();
        let mut came_from: HashMap<Cell, Cell> = HashMap::new();
        let mut open_set = BinaryHeap::new();
        best.insert(from, (0, 0));
        open_set.push(Reverse((0usize, 0u64, from)));

        while let Some(Reverse((blockers, len, cell))) = open_set.pop() {
            if best.get(&cell).is_some_and(|&b| b < (blockers, len)) {
                continue;
            }
            if cell == to {
                let mut path = vec![to];
                let mut current = to;
                while let Some(&prev) = came_from.get(&current) {
                    path.push(prev);
                    current = prev;
                }
                path.reverse();
                let mut parked: Vec<AgvId> = Vec::new();
                for cell in path.iter().skip(1) {
                    if let Some((holder, _)) = reservations.parked_by_other(agv_id, *cell) {
                        if !parked.contains(holder) {
                            parked.push(holder.clone());
                        }
                    }
                }
                return Some(Blockage { path, parked });
            }
            for next in self.world.neighbors(cell) {
                if reservations.is_obstacle(next) {
                    continue;
                }
                let extra = usize::from(reservations.parked_by_other(agv_id, next).is_some());
                let cost = (blockers + extra, len + 1);
                if best.get(&next).map_or(true, |&b| cost < b) {
                    best.insert(next, cost);
                    came_from.insert(next, cell);
                    open_set.push(Reverse((cost.0, cost.1, next)));
                }
            }
        }
        None
    }

    /// Nearest cell, by free aisle distance from `from`, where `agv_id` can
    /// wait without standing on a work cell, on `keep_clear` or on `taken`.
    pub fn holding_cell(
        &self,
        agv_id: &AgvId,
        from: Cell,
        keep_clear: &[Cell],
        taken: &BTreeSet<Cell>,
        reservations: &ReservationTable,
    ) -> Option<Cell> {
        let mut seen: HashSet<Cell> = HashSet::from([from]);
        let mut frontier = VecDeque::from([from]);
        while let Some(cell) = frontier.pop_front() {
            if cell != from
                && !self.world.is_work_cell(cell)
                && !keep_clear.contains(&cell)
                && !taken.contains(&cell)
            {
                return Some(cell);
            }
            for next in self.world.neighbors(cell) {
                if reservations.is_obstacle(next) || reservations.parked_by_other(agv_id, next).is_some() {
                    continue;
                }
                if seen.insert(next) {
                    frontier.push_back(next);
                }
            }
        }
        None
    }

    fn reconstruct(came_from: &HashMap<Node, Node>, goal: Node) -> Vec<Waypoint> {
        let mut nodes = vec![goal];
        let mut current = goal;
        while let Some(&prev) = came_from.get(&current) {
            nodes.push(prev);
            current = prev;
        }
        nodes.reverse();
        nodes
            .into_iter()
            .map(|(cell, step)| Waypoint::new(cell, step))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::world::WarehouseLayout;

    fn open_world(rows: usize, bays: usize) -> WorldMap {
        let row = ".".repeat(bays);
        let plan: Vec<&str> = (0..rows).map(|_| row.as_str()).collect();
        WorldMap::from_layout(&WarehouseLayout::new(&plan)).unwrap()
    }

    #[test]
    fn free_grid_route_has_manhattan_length() {
        let world = open_world(3, 5);
        let table = ReservationTable::new();
        let route = Pathfinder::new(&world, 500)
            .route(&AgvId::new("A"), Cell::new(1, 1), Cell::new(3, 5), 7, &table)
            .unwrap();
        assert_eq!(route.duration(), 6);
        assert_eq!(route.start(), Some(Waypoint::new(Cell::new(1, 1), 7)));
        assert_eq!(route.goal(), Some(Waypoint::new(Cell::new(3, 5), 13)));
        for pair in route.waypoints.windows(2) {
            assert!(pair[0].cell.is_adjacent(&pair[1].cell));
            assert_eq!(pair[1].step, pair[0].step + 1);
        }
    }

    #[test]
    fn waits_or_detours_around_a_crossing_agv() {
        let world = open_world(1, 5);
        let mut table = ReservationTable::new();
        // B sweeps down the single corridor ahead of A and parks at bay 5.
        let b_route = Route::new(
            AgvId::new("B"),
            (1..=5).map(|bay| Waypoint::new(Cell::new(1, bay), bay as Step)).collect(),
        );
        table.commit(&b_route).unwrap();
        let route = Pathfinder::new(&world, 50)
            .route(&AgvId::new("A"), Cell::new(1, 1), Cell::new(1, 4), 2, &table)
            .unwrap();
        for w in &route.waypoints {
            assert!(!table.is_blocked(&AgvId::new("A"), w.cell, w.step));
        }
        assert!(route.goal().unwrap().step >= table.earliest_safe_arrival(&AgvId::new("A"), Cell::new(1, 4)));
    }

    #[test]
    fn blocked_corridor_exhausts_horizon() {
        let world = open_world(1, 5);
        let mut table = ReservationTable::new();
        // B holds the chokepoint for the whole horizon.
        let blocker = Route::new(
            AgvId::new("B"),
            (0..=60).map(|step| Waypoint::new(Cell::new(1, 3), step)).collect(),
        );
        table.commit(&blocker).unwrap();
        let err = Pathfinder::new(&world, 20)
            .route(&AgvId::new("A"), Cell::new(1, 1), Cell::new(1, 5), 0, &table)
            .unwrap_err();
        assert!(matches!(err, DomainError::NoPath { horizon: 20, .. }));
    }

    #[test]
    fn goal_parked_by_other_names_the_holder() {
        let world = open_world(2, 2);
        let mut table = ReservationTable::new();
        table.park(&AgvId::new("B"), Cell::new(2, 2), 0);
        let err = Pathfinder::new(&world, 500)
            .route_with_stats(&AgvId::new("A"), Cell::new(1, 1), Cell::new(2, 2), 0, &table)
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::GoalOccupied { cell, ref agv_id } if cell == Cell::new(2, 2) && agv_id.as_str() == "B"
        ));
    }

    #[test]
    fn blockage_prefers_a_detour_over_a_parked_agv() {
        let world = open_world(2, 3);
        let mut table = ReservationTable::new();
        let pathfinder = Pathfinder::new(&world, 500);
        table.park(&AgvId::new("B"), Cell::new(1, 2), 0);
        let free = pathfinder
            .blockage(&AgvId::new("A"), Cell::new(1, 1), Cell::new(1, 3), &table)
            .unwrap();
        assert!(free.parked.is_empty());
        assert_eq!(free.path.len(), 5);

        table.park(&AgvId::new("C"), Cell::new(2, 2), 0);
        let blocked = pathfinder
            .blockage(&AgvId::new("A"), Cell::new(1, 1), Cell::new(1, 3), &table)
            .unwrap();
        assert_eq!(blocked.parked.len(), 1);
        assert_eq!(blocked.path.first(), Some(&Cell::new(1, 1)));
        assert_eq!(blocked.path.last(), Some(&Cell::new(1, 3)));
    }

    #[test]
    fn holding_cell_skips_work_cells_and_kept_clear_cells() {
        let layout = WarehouseLayout::new(&["....."]).with_location("D", 1, 2);
        let world = WorldMap::from_layout(&layout).unwrap();
        let table = ReservationTable::new();
        let pathfinder = Pathfinder::new(&world, 500);
        let a = AgvId::new("A");
        let none = BTreeSet::new();
        assert_eq!(
            pathfinder.holding_cell(&a, Cell::new(1, 2), &[], &none, &table),
            Some(Cell::new(1, 3))
        );
        assert_eq!(
            pathfinder.holding_cell(&a, Cell::new(1, 2), &[Cell::new(1, 1), Cell::new(1, 3)], &none, &table),
            Some(Cell::new(1, 4))
        );
        let taken = BTreeSet::from([Cell::new(1, 4), Cell::new(1, 5)]);
        assert_eq!(
            pathfinder.holding_cell(&a, Cell::new(1, 2), &[Cell::new(1, 1), Cell::new(1, 3)], &taken, &table),
            None
        );
    }

    #[test]
    fn unreachable_goal_is_no_path() {
        let world = WorldMap::from_layout(&WarehouseLayout::new(&[".#.", ".#."])).unwrap();
        let table = ReservationTable::new();
        assert!(Pathfinder::new(&world, 500)
            .route(&AgvId::new("A"), Cell::new(1, 1), Cell::new(1, 3), 0, &table)
            .is_err());
    }
}
