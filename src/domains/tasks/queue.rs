use super::task::{Priority, Task, TaskId, TaskKind, TaskRequest, TaskStatus};
use crate::common::{ApplicationError, ApplicationResult, DomainError, DomainResult, StateStore};
use crate::domains::fleet::AgvId;
use crate::domains::world::{Cell, WorldMap};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Dispatch order: priority descending, then arrival.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl ReadyKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: Reverse(task.priority),
            created_at: task.created_at,
            seq: task.seq,
            task_id: task.id,
        }
    }
}

/// Result of a cancel request that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was Pending or Assigned and is now Cancelled.
    Cancelled { task: Task, previous: TaskStatus },
    /// Repeated request on a Cancelled task; nothing changed.
    AlreadyCancelled,
    /// The task is under way; its mission will stop at the next stage boundary.
    AbortRequested(Task),
}

/// Task table plus the ordered index of Pending tasks.
#[derive(Debug, Default)]
pub struct QueueState {
    tasks: HashMap<TaskId, Task>,
    ready: BTreeSet<ReadyKey>,
    /// Open synthesized task of each AGV.
    bound: BTreeMap<AgvId, TaskId>,
    /// Synthesized tasks that reached a terminal status and await archival.
    retired: BTreeSet<TaskId>,
    next_seq: u64,
}

impl QueueState {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks in dispatch order.
    pub fn ready(&self) -> impl Iterator<Item = &Task> {
        self.ready.iter().filter_map(|key| self.tasks.get(&key.task_id))
    }

    /// The open Charge or Reposition task bound to `agv_id`, if any.
    pub fn bound_task(&self, agv_id: &AgvId) -> Option<&Task> {
        self.bound.get(agv_id).and_then(|id| self.tasks.get(id))
    }

    fn bound_tasks(&self) -> impl Iterator<Item = &Task> {
        self.bound.values().filter_map(|id| self.tasks.get(id))
    }

    /// Charging stations targeted by open Charge tasks.
    pub fn claimed_stations(&self) -> BTreeSet<Cell> {
        self.bound_tasks()
            .filter_map(|t| match &t.kind {
                TaskKind::Charge { station, .. } => Some(*station),
                _ => None,
            })
            .collect()
    }

    /// Holding cells targeted by open Reposition tasks.
    pub fn holding_targets(&self) -> BTreeSet<Cell> {
        self.bound_tasks()
            .filter_map(|t| match &t.kind {
                TaskKind::Reposition { target, .. } => Some(*target),
                _ => None,
            })
            .collect()
    }

    /// Replace a task in memory, keeping the ready and bound indexes in step
    /// with its status. The caller has already persisted `task`.
    pub(crate) fn put(&mut self, task: Task) {
        if let Some(old) = self.tasks.get(&task.id) {
            if old.status == TaskStatus::Pending {
                self.ready.remove(&ReadyKey::of(old));
            }
        }
        if task.status == TaskStatus::Pending {
            self.ready.insert(ReadyKey::of(&task));
        }
        if let Some(agv_id) = task.kind.bound_agv() {
            if task.is_terminal() {
                if self.bound.get(agv_id) == Some(&task.id) {
                    self.bound.remove(agv_id);
                }
                self.retired.insert(task.id);
            } else {
                self.bound.insert(agv_id.clone(), task.id);
            }
        }
        self.tasks.insert(task.id, task);
    }

    /// Persist and enqueue a new Pending task. An AGV carries at most one
    /// open synthesized task.
    pub async fn insert_new(
        &mut self,
        request: TaskRequest,
        store: &dyn StateStore,
    ) -> ApplicationResult<Task> {
        if let Some(agv_id) = request.kind.bound_agv() {
            if let Some(open) = self.bound.get(agv_id) {
                return Err(DomainError::AgvBusy {
                    agv_id: agv_id.clone(),
                    detail: format!("already bound to task {}", open),
                }
                .into());
            }
        }
        let task = Task::new(request, self.take_seq());
        store
            .save_task(&task)
            .await
            .map_err(ApplicationError::StateStore)?;
        self.put(task.clone());
        tracing::info!(
            "Task {} submitted ({} {:?}, seq {})",
            task.id,
            task.kind.name(),
            task.priority,
            task.seq
        );
        Ok(task)
    }

    /// Apply `mutate` to a copy of the task, persist it, then publish it.
    pub async fn commit<F>(
        &mut self,
        id: &TaskId,
        store: &dyn StateStore,
        mutate: F,
    ) -> ApplicationResult<(Task, Task)>
    where
        F: FnOnce(&mut Task) -> DomainResult<()>,
    {
        let before = self
            .tasks
            .get(id)
            .cloned()
            .ok_or(DomainError::TaskNotFound { task_id: *id })?;
        let mut next = before.clone();
        mutate(&mut next)?;
        next.version = before.version + 1;
        store
            .save_task(&next)
            .await
            .map_err(ApplicationError::StateStore)?;
        self.put(next.clone());
        Ok((before, next))
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Priority-ordered backlog of tasks awaiting or undergoing execution.
pub struct TaskQueue {
    world: Arc<WorldMap>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(world: Arc<WorldMap>) -> Self {
        Self {
            world,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Exclusive access to the whole queue. Take it before any AGV lock.
    pub async fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().await
    }

    /// Validate, persist and enqueue a new Pending task.
    pub async fn submit(
        &self,
        request: TaskRequest,
        store: &dyn StateStore,
    ) -> ApplicationResult<Task> {
        request.validate(&self.world)?;
        self.state.lock().await.insert_new(request, store).await
    }

    pub async fn next_ready(&self) -> Option<Task> {
        self.state.lock().await.ready().next().cloned()
    }

    pub async fn ready_tasks(&self) -> Vec<Task> {
        self.state.lock().await.ready().cloned().collect()
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.state.lock().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub async fn commit<F>(
        &self,
        id: &TaskId,
        store: &dyn StateStore,
        mutate: F,
    ) -> ApplicationResult<(Task, Task)>
    where
        F: FnOnce(&mut Task) -> DomainResult<()>,
    {
        self.state.lock().await.commit(id, store, mutate).await
    }

    /// Cancel a task that has not started moving. Repeating the request on a
    /// Cancelled task is a no-op.
    pub async fn cancel(
        &self,
        id: &TaskId,
        store: &dyn StateStore,
    ) -> ApplicationResult<CancelOutcome> {
        let mut state = self.state.lock().await;
        let status = state
            .get(id)
            .map(|t| t.status)
            .ok_or(DomainError::TaskNotFound { task_id: *id })?;
        match status {
            TaskStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            previous @ (TaskStatus::Pending | TaskStatus::Assigned) => {
                let (_, after) = state
                    .commit(id, store, |t| t.transition(TaskStatus::Cancelled))
                    .await?;
                tracing::info!("Task {} cancelled", id);
                Ok(CancelOutcome::Cancelled {
                    task: after,
                    previous,
                })
            }
            status => Err(DomainError::NotCancellable {
                task_id: *id,
                status,
            }
            .into()),
        }
    }

    /// Flag an under-way task for the mission to abort at its next stage
    /// boundary. Nothing is persisted until the mission acts on it.
    pub async fn request_abort(&self, id: &TaskId) -> DomainResult<CancelOutcome> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or(DomainError::TaskNotFound { task_id: *id })?;
        match task.status {
            TaskStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            TaskStatus::EnRoute | TaskStatus::AtPickup => {
                task.abort_requested = true;
                tracing::info!("Task {} abort requested", id);
                Ok(CancelOutcome::AbortRequested(task.clone()))
            }
            TaskStatus::Loaded | TaskStatus::EnRouteDropoff => {
                Err(DomainError::CannotCancelLoaded { task_id: *id })
            }
            status => Err(DomainError::NotCancellable {
                task_id: *id,
                status,
            }),
        }
    }

    /// Drop a terminal task from the queue.
    pub async fn archive(&self, id: &TaskId) -> DomainResult<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .get(id)
            .ok_or(DomainError::TaskNotFound { task_id: *id })?;
        if !task.is_terminal() {
            return Err(DomainError::InvalidTransition {
                task_id: *id,
                from: task.status,
                to: task.status,
            });
        }
        state.retired.remove(id);
        state.tasks.remove(id).ok_or(DomainError::TaskNotFound { task_id: *id })
    }

    /// Drop every retired synthesized task not listed in `in_use`.
    pub async fn archive_retired(&self, in_use: &BTreeSet<TaskId>) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        let done: Vec<TaskId> = state
            .retired
            .iter()
            .filter(|id| !in_use.contains(id))
            .copied()
            .collect();
        for id in &done {
            state.retired.remove(id);
            state.tasks.remove(id);
        }
        done
    }
}
