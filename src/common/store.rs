use crate::domains::fleet::Agv;
use crate::domains::tasks::Task;
use crate::domains::world::WarehouseLayout;

/// Durable state collaborator. Every write must be acknowledged before the
/// coordinator applies it in memory or emits an event for it.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load_layout(&self) -> Result<WarehouseLayout, String>;

    async fn load_agvs(&self) -> Result<Vec<Agv>, String>;

    async fn save_task(&self, task: &Task) -> Result<(), String>;

    async fn save_agv(&self, agv: &Agv) -> Result<(), String>;

    /// Persist a task and an AGV together; either both are stored or neither.
    async fn save_task_and_agv(&self, task: &Task, agv: &Agv) -> Result<(), String>;
}
