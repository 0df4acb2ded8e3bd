#![allow(dead_code)]

use agv_coordinator::adapters::outbound::{InMemoryEventSink, InMemoryStateStore};
use agv_coordinator::domains::fleet::{Agv, AgvId};
use agv_coordinator::domains::tasks::{TaskEvent, TaskId, TaskStatus};
use agv_coordinator::domains::world::{Cell, WarehouseLayout, WorldMap};
use agv_coordinator::{Config, EventSink, FleetCoordinator, StateStore};
use std::sync::Arc;

pub struct Harness {
    pub coordinator: FleetCoordinator,
    pub store: Arc<InMemoryStateStore>,
    pub sink: Arc<InMemoryEventSink>,
}

/// Short dwell so missions finish within a few dozen steps.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.dwell.load_ms = 200;
    config.dwell.unload_ms = 200;
    config.fleet.clear();
    config
}

/// 3 x 5 open floor with pickup P at (1,3) and dropoff D at (3,5).
pub fn small_floor() -> WarehouseLayout {
    WarehouseLayout::new(&[".....", ".....", "....."])
        .with_location("P", 1, 3)
        .with_location("D", 3, 5)
}

pub fn agv(world: &WorldMap, id: &str, row: u32, bay: u32, battery: f64) -> Agv {
    let cell = Cell::new(row, bay);
    Agv::new(AgvId::new(id), cell, world.position(cell), battery)
}

pub async fn harness(
    mut config: Config,
    layout: WarehouseLayout,
    fleet: &[(&str, u32, u32, f64)],
) -> Harness {
    config.layout = layout.clone();
    let world = WorldMap::from_layout(&layout).unwrap();
    let agvs: Vec<Agv> = fleet
        .iter()
        .map(|(id, row, bay, battery)| agv(&world, id, *row, *bay, *battery))
        .collect();
    let store = Arc::new(InMemoryStateStore::with_fleet(layout, agvs.clone()));
    let sink = Arc::new(InMemoryEventSink::new());
    let coordinator = FleetCoordinator::new(
        &config,
        world,
        agvs,
        store.clone() as Arc<dyn StateStore>,
        sink.clone() as Arc<dyn EventSink>,
    )
    .await
    .unwrap();
    Harness {
        coordinator,
        store,
        sink,
    }
}

impl Harness {
    /// Current status; archived tasks are read back from the store.
    pub async fn status(&self, task_id: &TaskId) -> TaskStatus {
        match self.coordinator.task(task_id).await {
            Some(task) => task.status,
            None => self.store.task(task_id).await.unwrap().status,
        }
    }

    /// Step until `task_id` reaches `status` or `limit` steps have passed.
    pub async fn run_until(&self, task_id: &TaskId, status: TaskStatus, limit: u64) -> bool {
        for _ in 0..limit {
            if self.status(task_id).await == status {
                return true;
            }
            self.coordinator.step().await.unwrap();
        }
        self.status(task_id).await == status
    }

    /// New statuses reported for a task, in delivery order.
    pub async fn task_statuses(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        self.sink
            .events_for("Task", &task_id.to_string())
            .await
            .into_iter()
            .filter_map(|e| match serde_json::from_value::<TaskEvent>(e.payload) {
                Ok(TaskEvent::StatusChanged { new_status, .. }) => Some(new_status),
                _ => None,
            })
            .collect()
    }
}
