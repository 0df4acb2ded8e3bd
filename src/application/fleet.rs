use super::planner::RoutePlanner;
use super::publisher::EventPublisher;
use crate::common::{ApplicationError, ApplicationResult, DomainError, DomainResult, StateStore};
use crate::config::{BatteryConfig, CoordinatorConfig, DwellConfig};
use crate::domains::fleet::{Agv, AgvEvent, AgvId, AgvRegistry, AgvStatus};
use crate::domains::tasks::{Task, TaskEvent, TaskId, TaskQueue, TaskRequest, TaskStatus};
use crate::domains::world::{Cell, WorldMap};
use chrono::Utc;
use std::sync::Arc;

/// Before and after images of one committed mutation.
pub type Change<T> = (T, T);

/// Result of a commit at a mission stage boundary.
#[derive(Debug, Clone)]
pub enum StageCommit {
    Committed {
        task: Option<Change<Task>>,
        agv: Change<Agv>,
    },
    /// The task was cancelled instead; the AGV has been released.
    Aborted {
        task: Option<Change<Task>>,
        agv: Change<Agv>,
    },
}

/// Settings the application services read on every pass.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub coordinator: CoordinatorConfig,
    pub battery: BatteryConfig,
    pub dwell: DwellConfig,
}

impl FleetSettings {
    pub fn load_steps(&self) -> u64 {
        self.dwell.load_steps(self.coordinator.step_interval_ms)
    }

    pub fn unload_steps(&self) -> u64 {
        self.dwell.unload_steps(self.coordinator.step_interval_ms)
    }
}

/// Everything the dispatcher and the missions share.
pub struct FleetState {
    pub settings: FleetSettings,
    pub world: Arc<WorldMap>,
    pub registry: AgvRegistry,
    pub queue: TaskQueue,
    pub planner: RoutePlanner,
    pub store: Arc<dyn StateStore>,
    pub events: EventPublisher,
}

impl FleetState {
    pub fn new(
        settings: FleetSettings,
        world: Arc<WorldMap>,
        agvs: Vec<Agv>,
        store: Arc<dyn StateStore>,
        events: EventPublisher,
    ) -> Self {
        let planner = RoutePlanner::new(
            world.clone(),
            settings.coordinator.search_horizon,
            settings.coordinator.commit_attempts,
        );
        Self {
            queue: TaskQueue::new(world.clone()),
            registry: AgvRegistry::new(agvs),
            planner,
            settings,
            world,
            store,
            events,
        }
    }

    /// Cruise speed: one cell per step.
    pub fn travel_speed_mps(&self) -> f64 {
        let step_s = self.settings.coordinator.step_interval_ms as f64 / 1000.0;
        if step_s > 0.0 {
            self.world.cell_size_m() / step_s
        } else {
            0.0
        }
    }

    /// Bind a Pending task to an idle AGV, persisting both in one write.
    /// Fails if either changed since the caller looked at it.
    pub async fn assign(
        &self,
        task_id: &TaskId,
        agv_id: &AgvId,
        expected_agv_version: u64,
    ) -> ApplicationResult<(Change<Task>, Change<Agv>)> {
        let mut queue = self.queue.lock().await;
        let task_before = queue
            .get(task_id)
            .cloned()
            .ok_or(DomainError::TaskNotFound { task_id: *task_id })?;
        let mut agv_guard = self.registry.lock(agv_id).await?;
        let agv_before = agv_guard.clone();

        if agv_before.version != expected_agv_version {
            return Err(DomainError::ConcurrencyConflict {
                entity: format!("agv {}", agv_id),
                expected: expected_agv_version,
                actual: agv_before.version,
            }
            .into());
        }
        if !agv_before.is_idle() {
            let detail = match agv_before.current_task_id {
                Some(current) => format!("{} on task {}", agv_before.status.as_str(), current),
                None => agv_before.status.as_str().to_string(),
            };
            return Err(DomainError::AgvBusy {
                agv_id: agv_id.clone(),
                detail,
            }
            .into());
        }

        let mut task_next = task_before.clone();
        task_next.transition(TaskStatus::Assigned)?;
        task_next.assigned_agv = Some(agv_id.clone());
        task_next.version += 1;

        let mut agv_next = agv_before.clone();
        agv_next.current_task_id = Some(*task_id);
        agv_next.version += 1;
        agv_next.updated_at = Utc::now();

        self.store
            .save_task_and_agv(&task_next, &agv_next)
            .await
            .map_err(ApplicationError::StateStore)?;
        queue.put(task_next.clone());
        *agv_guard = agv_next.clone();
        Ok(((task_before, task_next), (agv_before, agv_next)))
    }

    /// Commit a mission step that touches the task and the AGV together.
    ///
    /// If the task was cancelled from outside, or `honor_abort` is set and a
    /// cancel request is pending, the task is cancelled and the AGV released
    /// instead of applying the mutations.
    pub async fn commit_stage<T, A>(
        &self,
        task_id: &TaskId,
        agv_id: &AgvId,
        honor_abort: bool,
        task_mut: T,
        agv_mut: A,
    ) -> ApplicationResult<StageCommit>
    where
        T: FnOnce(&mut Task) -> DomainResult<()>,
        A: FnOnce(&mut Agv) -> DomainResult<()>,
    {
        let mut queue = self.queue.lock().await;
        let task_before = queue
            .get(task_id)
            .cloned()
            .ok_or(DomainError::TaskNotFound { task_id: *task_id })?;
        let mut agv_guard = self.registry.lock(agv_id).await?;
        let agv_before = agv_guard.clone();

        let mut task_next = task_before.clone();
        let mut agv_next = agv_before.clone();
        let aborted = if task_before.is_terminal() {
            release_agv(&mut agv_next);
            true
        } else if honor_abort && task_before.abort_requested {
            task_next.transition(TaskStatus::Cancelled)?;
            release_agv(&mut agv_next);
            true
        } else {
            task_mut(&mut task_next)?;
            agv_mut(&mut agv_next)?;
            false
        };

        let task_changed = task_next != task_before;
        agv_next.version = agv_before.version + 1;
        agv_next.updated_at = Utc::now();
        if task_changed {
            task_next.version = task_before.version + 1;
            self.store
                .save_task_and_agv(&task_next, &agv_next)
                .await
                .map_err(ApplicationError::StateStore)?;
            queue.put(task_next.clone());
        } else {
            self.store
                .save_agv(&agv_next)
                .await
                .map_err(ApplicationError::StateStore)?;
        }
        *agv_guard = agv_next.clone();

        let task = task_changed.then_some((task_before, task_next));
        let agv = (agv_before, agv_next);
        Ok(if aborted {
            StageCommit::Aborted { task, agv }
        } else {
            StageCommit::Committed { task, agv }
        })
    }

    /// Quarantine an AGV: it goes Faulted, its open task (if any) fails, and
    /// its cell becomes a static obstacle.
    pub async fn fault_agv(
        &self,
        agv_id: &AgvId,
        reason: &str,
    ) -> ApplicationResult<(Option<Change<Task>>, Change<Agv>)> {
        let (task, agv) = {
            let mut queue = self.queue.lock().await;
            let mut agv_guard = self.registry.lock(agv_id).await?;
            let agv_before = agv_guard.clone();
            let mut agv_next = agv_before.clone();
            agv_next.status = AgvStatus::Faulted;
            agv_next.fault_reason = Some(reason.to_string());
            agv_next.current_task_id = None;
            agv_next.speed_mps = 0.0;
            agv_next.version = agv_before.version + 1;
            agv_next.updated_at = Utc::now();

            let open_task = agv_before
                .current_task_id
                .and_then(|id| queue.get(&id).cloned())
                .filter(|t| !t.is_terminal());
            match open_task {
                Some(task_before) => {
                    let mut task_next = task_before.clone();
                    let fault = DomainError::AgvFault {
                        agv_id: agv_id.clone(),
                        reason: reason.to_string(),
                    };
                    task_next.fail(fault.to_string())?;
                    task_next.version = task_before.version + 1;
                    self.store
                        .save_task_and_agv(&task_next, &agv_next)
                        .await
                        .map_err(ApplicationError::StateStore)?;
                    queue.put(task_next.clone());
                    *agv_guard = agv_next.clone();
                    (Some((task_before, task_next)), (agv_before, agv_next))
                }
                None => {
                    self.store
                        .save_agv(&agv_next)
                        .await
                        .map_err(ApplicationError::StateStore)?;
                    *agv_guard = agv_next.clone();
                    (None, (agv_before, agv_next))
                }
            }
        };
        self.planner.quarantine(agv_id, agv.1.cell).await;
        tracing::error!("AGV {} faulted at {}: {}", agv_id, agv.1.cell, reason);
        Ok((task, agv))
    }

    /// Ask an AGV standing in someone's way to move to a holding cell off
    /// `keep_clear`. Idle AGVs get a Reposition task. Returns whether the
    /// occupant is going to move without further help.
    pub async fn request_yield(&self, occupant: &AgvId, keep_clear: &[Cell]) -> ApplicationResult<bool> {
        let task = {
            let mut queue = self.queue.lock().await;
            if queue.bound_task(occupant).is_some() {
                return Ok(true);
            }
            let agv = self
                .registry
                .get(occupant)
                .await
                .ok_or_else(|| DomainError::AgvNotFound { agv_id: occupant.clone() })?;
            if agv.is_faulted() || !agv.is_idle() {
                return Ok(false);
            }
            let taken = queue.holding_targets();
            let Some(target) = self
                .planner
                .holding_cell(occupant, agv.cell, keep_clear, &taken)
                .await
            else {
                tracing::debug!("No holding cell for {} away from {}", occupant, agv.cell);
                return Ok(false);
            };
            let request = TaskRequest::reposition(occupant.clone(), target);
            request.validate(&self.world)?;
            queue.insert_new(request, self.store.as_ref()).await?
        };
        tracing::info!("{} asked to clear the way (task {})", occupant, task.id);
        self.events
            .publish_correlated(&TaskEvent::submitted(&task), task.id.0)
            .await?;
        Ok(true)
    }

    pub async fn publish_task_change(&self, change: &Change<Task>) -> ApplicationResult<()> {
        let (before, after) = change;
        if before.status != after.status {
            self.events
                .publish_correlated(&TaskEvent::status_changed(before, after), after.id.0)
                .await?;
        }
        Ok(())
    }

    /// Status and whole-percent battery changes of an AGV.
    pub async fn publish_agv_change(&self, change: &Change<Agv>) -> ApplicationResult<()> {
        let (before, after) = change;
        if before.status != after.status || before.current_task_id != after.current_task_id {
            self.events
                .publish(&AgvEvent::status_changed(before, after))
                .await?;
        }
        if before.battery.floor() != after.battery.floor() {
            self.events
                .publish(&AgvEvent::battery_changed(after))
                .await?;
        }
        Ok(())
    }

    pub async fn publish_stage_commit(&self, commit: &StageCommit) -> ApplicationResult<()> {
        let (task, agv) = match commit {
            StageCommit::Committed { task, agv } | StageCommit::Aborted { task, agv } => (task, agv),
        };
        if let Some(task) = task {
            self.publish_task_change(task).await?;
        }
        self.publish_agv_change(agv).await
    }
}

fn release_agv(agv: &mut Agv) {
    if !agv.is_faulted() {
        agv.status = AgvStatus::Idle;
    }
    agv.current_task_id = None;
    agv.speed_mps = 0.0;
}
