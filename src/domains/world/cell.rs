use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete floor-plan coordinate. Rows and bays are 1-based, as on the
/// warehouse racking plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub row: u32,
    pub bay: u32,
}

impl Cell {
    pub const fn new(row: u32, bay: u32) -> Self {
        Self { row, bay }
    }

    pub fn manhattan(&self, other: &Cell) -> u64 {
        (self.row.abs_diff(other.row) + self.bay.abs_diff(other.bay)) as u64
    }

    /// 4-connected neighbors that are still valid 1-based coordinates.
    /// Grid bounds are the map's concern.
    pub fn neighbors_4(&self) -> impl Iterator<Item = Cell> {
        let Cell { row, bay } = *self;
        [
            (row.checked_sub(1), Some(bay)),
            (Some(row), bay.checked_add(1)),
            (row.checked_add(1), Some(bay)),
            (Some(row), bay.checked_sub(1)),
        ]
        .into_iter()
        .filter_map(|(r, b)| match (r, b) {
            (Some(r), Some(b)) if r >= 1 && b >= 1 => Some(Cell::new(r, b)),
            _ => None,
        })
    }

    pub fn is_adjacent(&self, other: &Cell) -> bool {
        self.manhattan(other) == 1
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.bay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    Aisle,
    Rack,
    ChargingStation,
    DockDoor,
}

impl CellKind {
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '.' => Some(CellKind::Aisle),
            '#' => Some(CellKind::Rack),
            'C' => Some(CellKind::ChargingStation),
            'D' => Some(CellKind::DockDoor),
            _ => None,
        }
    }

    pub fn is_traversable(&self) -> bool {
        !matches!(self, CellKind::Rack)
    }

    pub fn is_charging_station(&self) -> bool {
        matches!(self, CellKind::ChargingStation)
    }
}

/// Metric position on the warehouse floor, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position2D {
    pub x: f64,
    pub y: f64,
}
