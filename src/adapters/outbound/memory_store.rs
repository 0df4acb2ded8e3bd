use crate::common::StateStore;
use crate::domains::fleet::{Agv, AgvId};
use crate::domains::tasks::{Task, TaskId};
use crate::domains::world::WarehouseLayout;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Process-local state store for tests and single-node runs.
///
/// Writes can be made to fail on demand to exercise the coordinator's
/// "nothing changes unless the store acknowledged it" paths.
pub struct InMemoryStateStore {
    layout: WarehouseLayout,
    agvs: RwLock<BTreeMap<AgvId, Agv>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryStateStore {
    /// Default layout, no AGVs.
    pub fn new() -> Self {
        Self::with_fleet(WarehouseLayout::default(), Vec::new())
    }

    pub fn with_fleet(layout: WarehouseLayout, agvs: Vec<Agv>) -> Self {
        Self {
            layout,
            agvs: RwLock::new(agvs.into_iter().map(|a| (a.id.clone(), a)).collect()),
            tasks: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// While set, every write is rejected and nothing is stored.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of acknowledged write calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn agv(&self, id: &AgvId) -> Option<Agv> {
        self.agvs.read().await.get(id).cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    fn check_writable(&self) -> Result<(), String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("state store unavailable (injected failure)".to_string());
        }
        Ok(())
    }

    fn acknowledge(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_layout(&self) -> Result<WarehouseLayout, String> {
        Ok(self.layout.clone())
    }

    async fn load_agvs(&self) -> Result<Vec<Agv>, String> {
        Ok(self.agvs.read().await.values().cloned().collect())
    }

    async fn save_task(&self, task: &Task) -> Result<(), String> {
        self.check_writable()?;
        self.tasks.write().await.insert(task.id, task.clone());
        self.acknowledge();
        Ok(())
    }

    async fn save_agv(&self, agv: &Agv) -> Result<(), String> {
        self.check_writable()?;
        self.agvs.write().await.insert(agv.id.clone(), agv.clone());
        self.acknowledge();
        Ok(())
    }

    async fn save_task_and_agv(&self, task: &Task, agv: &Agv) -> Result<(), String> {
        self.check_writable()?;
        // Queue before AGV, as everywhere else.
        let mut tasks = self.tasks.write().await;
        let mut agvs = self.agvs.write().await;
        tasks.insert(task.id, task.clone());
        agvs.insert(agv.id.clone(), agv.clone());
        self.acknowledge();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::tasks::{Priority, TaskRequest};
    use crate::domains::world::{Cell, Position2D};

    #[tokio::test]
    async fn injected_failure_stores_nothing() {
        let store = InMemoryStateStore::new();
        let task = Task::new(TaskRequest::transport("A-01", "B-01", Priority::Normal), 0);
        let agv = Agv::new(AgvId::new("AGV-01"), Cell::new(1, 1), Position2D::default(), 90.0);

        store.fail_writes(true);
        assert!(store.save_task_and_agv(&task, &agv).await.is_err());
        assert!(store.task(&task.id).await.is_none());
        assert!(store.agv(&agv.id).await.is_none());

        store.fail_writes(false);
        store.save_task_and_agv(&task, &agv).await.unwrap();
        assert_eq!(store.task(&task.id).await.unwrap().id, task.id);
        assert_eq!(store.write_count(), 1);
    }
}
