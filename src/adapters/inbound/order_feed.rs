use crate::application::FleetCoordinator;
use crate::config::DemoConfig;
use crate::domains::tasks::{Priority, TaskId, TaskRequest};
use crate::domains::world::{LocationId, WorldMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Synthetic transport orders between the layout's named locations, for
/// running the coordinator without an order management system attached.
pub struct DemoOrderFeed {
    rng: StdRng,
    pairs: Vec<(LocationId, LocationId)>,
}

impl DemoOrderFeed {
    /// Every ordered pair of distinct, mutually reachable locations is a
    /// candidate order.
    pub fn new(world: &WorldMap, seed: Option<u64>) -> Self {
        let locations: Vec<_> = world.locations().collect();
        let mut pairs = Vec::new();
        for pickup in &locations {
            for dropoff in &locations {
                if pickup.cell != dropoff.cell && world.is_reachable(pickup.cell, dropoff.cell) {
                    pairs.push((pickup.id.clone(), dropoff.id.clone()));
                }
            }
        }
        pairs.sort();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn next_order(&mut self) -> Option<TaskRequest> {
        if self.pairs.is_empty() {
            return None;
        }
        let (pickup, dropoff) = self.pairs[self.rng.gen_range(0..self.pairs.len())].clone();
        let priority = match self.rng.gen_range(0..20) {
            0 => Priority::Urgent,
            1..=3 => Priority::High,
            4..=5 => Priority::Low,
            _ => Priority::Normal,
        };
        Some(TaskRequest::transport(pickup.0, dropoff.0, priority))
    }

    /// Submit one order every `order_interval_ms` until `shutdown` resolves.
    /// Orders that reached a terminal status are archived along the way.
    pub async fn run<F>(mut self, coordinator: Arc<FleetCoordinator>, config: DemoConfig, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if config.order_interval_ms == 0 || self.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(config.order_interval_ms));
        let mut open: Vec<TaskId> = Vec::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    Self::archive_finished(&coordinator, &mut open).await;
                    let Some(order) = self.next_order() else { break };
                    match coordinator.submit_task(order).await {
                        Ok(task_id) => {
                            tracing::debug!("Demo order {} submitted", task_id);
                            open.push(task_id);
                        }
                        Err(e) => tracing::warn!("Demo order rejected: {}", e),
                    }
                }
            }
        }
    }

    /// Archive finished orders once every event about them has gone out.
    async fn archive_finished(coordinator: &FleetCoordinator, open: &mut Vec<TaskId>) {
        if coordinator.pending_events().await > 0 {
            return;
        }
        let mut still_open = Vec::with_capacity(open.len());
        for task_id in open.drain(..) {
            match coordinator.task(&task_id).await {
                Some(task) if task.is_terminal() => {
                    if let Err(e) = coordinator.archive_task(&task_id).await {
                        tracing::warn!("Demo order {} not archived: {}", task_id, e);
                    }
                }
                Some(_) => still_open.push(task_id),
                None => {}
            }
        }
        *open = still_open;
    }
}
