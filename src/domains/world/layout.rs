use super::cell::Position2D;
use serde::{Deserialize, Serialize};

/// Physical layout as delivered by the state store: an ASCII floor plan plus
/// named locations.
///
/// Plan symbols: `.` aisle, `#` rack, `C` charging station, `D` dock door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseLayout {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_cell_size")]
    pub cell_size_m: f64,
    #[serde(default)]
    pub origin: Position2D,
    pub plan: Vec<String>,
    #[serde(default)]
    pub locations: Vec<LocationSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSpec {
    pub id: String,
    pub row: u32,
    pub bay: u32,
}

fn default_name() -> String {
    "warehouse".to_string()
}

fn default_cell_size() -> f64 {
    2.0
}

impl WarehouseLayout {
    pub fn new(plan: &[&str]) -> Self {
        Self {
            name: default_name(),
            cell_size_m: default_cell_size(),
            origin: Position2D::default(),
            plan: plan.iter().map(|row| row.to_string()).collect(),
            locations: Vec::new(),
        }
    }

    pub fn with_location(mut self, id: &str, row: u32, bay: u32) -> Self {
        self.locations.push(LocationSpec {
            id: id.to_string(),
            row,
            bay,
        });
        self
    }
}

impl Default for WarehouseLayout {
    fn default() -> Self {
        WarehouseLayout::new(&[
            "C........D",
            ".##.##.##.",
            "..........",
            ".##.##.##.",
            "C.........",
        ])
        .with_location("A-01", 1, 3)
        .with_location("A-02", 3, 5)
        .with_location("B-01", 3, 8)
        .with_location("B-02", 5, 6)
        .with_location("DOCK-1", 1, 10)
    }
}
