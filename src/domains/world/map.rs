use super::cell::{Cell, CellKind, Position2D};
use super::layout::WarehouseLayout;
use super::location::{Location, LocationId};
use crate::common::{DomainError, DomainResult};
use petgraph::unionfind::UnionFind;
use std::collections::BTreeMap;

/// Static grid derived from the warehouse layout. Immutable after load.
#[derive(Debug, Clone)]
pub struct WorldMap {
    name: String,
    rows: u32,
    bays: u32,
    cell_size_m: f64,
    origin: Position2D,
    cells: Vec<CellKind>,
    locations: BTreeMap<LocationId, Location>,
    charging_stations: Vec<Cell>,
    /// Connected-component label per cell index; `None` for racks.
    components: Vec<Option<usize>>,
}

impl WorldMap {
    pub fn from_layout(layout: &WarehouseLayout) -> DomainResult<Self> {
        if layout.plan.is_empty() {
            return Err(DomainError::layout("floor plan has no rows"));
        }
        if layout.cell_size_m.is_nan() || layout.cell_size_m <= 0.0 {
            return Err(DomainError::layout("cell size must be positive"));
        }

        let bays = layout.plan[0].chars().count();
        if bays == 0 {
            return Err(DomainError::layout("floor plan has no bays"));
        }

        let mut cells = Vec::with_capacity(layout.plan.len() * bays);
        for (r, line) in layout.plan.iter().enumerate() {
            if line.chars().count() != bays {
                return Err(DomainError::layout(format!(
                    "row {} has {} bays, expected {}",
                    r + 1,
                    line.chars().count(),
                    bays
                )));
            }
            for (b, symbol) in line.chars().enumerate() {
                let kind = CellKind::from_symbol(symbol).ok_or_else(|| {
                    DomainError::layout(format!(
                        "unknown symbol '{}' at ({},{})",
                        symbol,
                        r + 1,
                        b + 1
                    ))
                })?;
                cells.push(kind);
            }
        }

        let mut map = Self {
            name: layout.name.clone(),
            rows: layout.plan.len() as u32,
            bays: bays as u32,
            cell_size_m: layout.cell_size_m,
            origin: layout.origin,
            cells,
            locations: BTreeMap::new(),
            charging_stations: Vec::new(),
            components: Vec::new(),
        };

        map.charging_stations = map
            .all_cells()
            .filter(|c| map.is_charging_station(*c))
            .collect();

        for spec in &layout.locations {
            let id = LocationId::new(spec.id.clone());
            let cell = Cell::new(spec.row, spec.bay);
            if !map.contains(cell) {
                return Err(DomainError::layout(format!(
                    "location {} at {} is outside the grid",
                    id, cell
                )));
            }
            if !map.is_traversable(cell) {
                return Err(DomainError::layout(format!(
                    "location {} at {} is inside rack structure",
                    id, cell
                )));
            }
            if map.locations.contains_key(&id) {
                return Err(DomainError::layout(format!("duplicate location id {}", id)));
            }
            map.locations.insert(id.clone(), Location { id, cell });
        }

        map.components = map.label_components();
        Ok(map)
    }

    fn label_components(&self) -> Vec<Option<usize>> {
        let mut sets = UnionFind::<usize>::new(self.cells.len());
        for cell in self.all_cells().filter(|c| self.is_traversable(*c)) {
            let idx = self.index(cell);
            // Right and down are enough to cover every edge once.
            for next in [Cell::new(cell.row, cell.bay + 1), Cell::new(cell.row + 1, cell.bay)] {
                if self.is_traversable(next) {
                    sets.union(idx, self.index(next));
                }
            }
        }
        self.all_cells()
            .map(|c| {
                if self.is_traversable(c) {
                    Some(sets.find(self.index(c)))
                } else {
                    None
                }
            })
            .collect()
    }

    fn index(&self, cell: Cell) -> usize {
        ((cell.row - 1) * self.bays + (cell.bay - 1)) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell_size_m(&self) -> f64 {
        self.cell_size_m
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn bays(&self) -> u32 {
        self.bays
    }

    pub fn all_cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (1..=self.rows).flat_map(move |row| (1..=self.bays).map(move |bay| Cell::new(row, bay)))
    }

    pub fn contains(&self, cell: Cell) -> bool {
        cell.row >= 1 && cell.row <= self.rows && cell.bay >= 1 && cell.bay <= self.bays
    }

    pub fn kind(&self, cell: Cell) -> Option<CellKind> {
        if self.contains(cell) {
            Some(self.cells[self.index(cell)])
        } else {
            None
        }
    }

    pub fn is_traversable(&self, cell: Cell) -> bool {
        self.kind(cell).map(|k| k.is_traversable()).unwrap_or(false)
    }

    pub fn is_charging_station(&self, cell: Cell) -> bool {
        self.kind(cell)
            .map(|k| k.is_charging_station())
            .unwrap_or(false)
    }

    pub fn charging_stations(&self) -> &[Cell] {
        &self.charging_stations
    }

    /// Pickup, dropoff and charging cells: places AGVs stop to work.
    pub fn is_work_cell(&self, cell: Cell) -> bool {
        self.is_charging_station(cell) || self.locations.values().any(|l| l.cell == cell)
    }

    pub fn location(&self, id: &LocationId) -> Option<&Location> {
        self.locations.get(id)
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    /// Traversable 4-neighbors of `cell`.
    pub fn neighbors(&self, cell: Cell) -> impl Iterator<Item = Cell> + '_ {
        cell.neighbors_4().filter(move |n| self.is_traversable(*n))
    }

    /// Whether any static path connects `a` and `b`, ignoring other AGVs.
    pub fn is_reachable(&self, a: Cell, b: Cell) -> bool {
        if !self.is_traversable(a) || !self.is_traversable(b) {
            return false;
        }
        self.components[self.index(a)] == self.components[self.index(b)]
    }

    /// Metric center of a cell.
    pub fn position(&self, cell: Cell) -> Position2D {
        Position2D {
            x: self.origin.x + (cell.bay.saturating_sub(1)) as f64 * self.cell_size_m,
            y: self.origin.y + (cell.row.saturating_sub(1)) as f64 * self.cell_size_m,
        }
    }
}
