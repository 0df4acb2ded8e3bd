use super::dispatcher::{Dispatched, Dispatcher};
use super::fleet::{FleetSettings, FleetState};
use super::mission::{MissionHandle, MissionRunner};
use super::publisher::EventPublisher;
use crate::common::{ApplicationError, ApplicationResult, DomainError, EventSink, StateStore};
use crate::config::Config;
use crate::domains::fleet::{Agv, AgvEvent, AgvId, AgvStatus};
use crate::domains::mission::MissionCommand;
use crate::domains::planning::{Conflict, ReservationTable, Step};
use crate::domains::tasks::{CancelOutcome, Task, TaskEvent, TaskId, TaskRequest, TaskStatus};
use crate::domains::world::WorldMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
struct MissionBoard {
    /// Missions advanced by [`FleetCoordinator::step`].
    local: BTreeMap<TaskId, MissionRunner>,
    /// Missions running as their own tokio tasks under [`FleetCoordinator::run`].
    spawned: Vec<JoinHandle<()>>,
    handles: HashMap<TaskId, MissionHandle>,
}

/// Public face of the coordinator: task intake, cancellation, fault reports
/// and the clock that drives dispatching and missions.
pub struct FleetCoordinator {
    fleet: Arc<FleetState>,
    dispatcher: Dispatcher,
    clock: watch::Sender<Step>,
    dispatch_guard: Mutex<()>,
    missions: Mutex<MissionBoard>,
}

impl FleetCoordinator {
    /// Build from the state store's layout and AGVs.
    pub async fn bootstrap(
        config: &Config,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
    ) -> ApplicationResult<Self> {
        let layout = store.load_layout().await.map_err(ApplicationError::StateStore)?;
        let world = WorldMap::from_layout(&layout)?;
        let agvs = store.load_agvs().await.map_err(ApplicationError::StateStore)?;
        Self::new(config, world, agvs, store, sink).await
    }

    pub async fn new(
        config: &Config,
        world: WorldMap,
        agvs: Vec<Agv>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
    ) -> ApplicationResult<Self> {
        for agv in &agvs {
            if !world.is_traversable(agv.cell) {
                return Err(DomainError::layout(format!(
                    "AGV {} starts on non-traversable cell {}",
                    agv.id, agv.cell
                ))
                .into());
            }
        }
        let settings = FleetSettings {
            coordinator: config.coordinator.clone(),
            battery: config.battery.clone(),
            dwell: config.dwell.clone(),
        };
        let events = EventPublisher::new(sink, config.coordinator.source.clone());
        let fleet = Arc::new(FleetState::new(
            settings,
            Arc::new(world),
            agvs.clone(),
            store,
            events,
        ));
        for agv in &agvs {
            if agv.is_faulted() {
                fleet.planner.quarantine(&agv.id, agv.cell).await;
            } else {
                fleet.planner.park(&agv.id, agv.cell, 0).await;
            }
        }
        tracing::info!(
            "Coordinator ready: {} ({}x{}), {} AGVs",
            fleet.world.name(),
            fleet.world.rows(),
            fleet.world.bays(),
            agvs.len()
        );
        let (clock, _) = watch::channel(0);
        Ok(Self {
            dispatcher: Dispatcher::new(fleet.clone()),
            fleet,
            clock,
            dispatch_guard: Mutex::new(()),
            missions: Mutex::new(MissionBoard::default()),
        })
    }

    pub fn fleet(&self) -> &Arc<FleetState> {
        &self.fleet
    }

    pub fn now(&self) -> Step {
        *self.clock.borrow()
    }

    pub fn world(&self) -> &WorldMap {
        &self.fleet.world
    }

    pub async fn submit_task(&self, request: TaskRequest) -> ApplicationResult<TaskId> {
        let task = self
            .fleet
            .queue
            .submit(request, self.fleet.store.as_ref())
            .await?;
        self.fleet
            .events
            .publish_correlated(&TaskEvent::submitted(&task), task.id.0)
            .await?;
        Ok(task.id)
    }

    /// Cancel a task. Pending and Assigned tasks are cancelled at once;
    /// tasks already on their way are stopped by their mission at the next
    /// stage boundary. Loaded tasks can no longer be cancelled.
    pub async fn cancel_task(&self, task_id: &TaskId) -> ApplicationResult<CancelOutcome> {
        let outcome = match self.fleet.queue.cancel(task_id, self.fleet.store.as_ref()).await {
            Ok(outcome) => outcome,
            Err(ApplicationError::Domain(DomainError::NotCancellable { status, .. }))
                if matches!(
                    status,
                    TaskStatus::EnRoute
                        | TaskStatus::AtPickup
                        | TaskStatus::Loaded
                        | TaskStatus::EnRouteDropoff
                ) =>
            {
                self.fleet.queue.request_abort(task_id).await?
            }
            Err(e) => return Err(e),
        };

        match &outcome {
            CancelOutcome::Cancelled { task, previous } => {
                let before = Task {
                    status: *previous,
                    ..task.clone()
                };
                self.fleet
                    .events
                    .publish_correlated(&TaskEvent::status_changed(&before, task), task.id.0)
                    .await?;
                self.notify(task_id, MissionCommand::Cancel).await;
            }
            CancelOutcome::AbortRequested(_) => {
                self.notify(task_id, MissionCommand::Cancel).await;
            }
            CancelOutcome::AlreadyCancelled => {}
        }
        Ok(outcome)
    }

    /// External hardware fault. With an active mission the mission handles it;
    /// otherwise the AGV is quarantined here.
    pub async fn report_fault(&self, agv_id: &AgvId, reason: &str) -> ApplicationResult<()> {
        let agv = self
            .fleet
            .registry
            .get(agv_id)
            .await
            .ok_or_else(|| DomainError::AgvNotFound { agv_id: agv_id.clone() })?;
        if agv.status == AgvStatus::Faulted {
            return Ok(());
        }
        if let Some(task_id) = agv.current_task_id {
            let fault = MissionCommand::Fault {
                reason: reason.to_string(),
            };
            if self.notify(&task_id, fault).await {
                tracing::warn!("Fault on {} routed to mission {}", agv_id, task_id);
                return Ok(());
            }
        }

        let (task, change) = self.fleet.fault_agv(agv_id, reason).await?;
        if let Some(task) = &task {
            self.fleet.publish_task_change(task).await?;
        }
        self.fleet.publish_agv_change(&change).await?;
        self.fleet
            .events
            .publish(&AgvEvent::faulted(&change.1, change.0.current_task_id))
            .await
    }

    async fn notify(&self, task_id: &TaskId, command: MissionCommand) -> bool {
        let handle = self.missions.lock().await.handles.get(task_id).cloned();
        match handle {
            Some(handle) => handle.send(command).await,
            None => false,
        }
    }

    /// Advance the clock by one step and drive everything due at that step.
    /// Missions are advanced before the dispatcher so that AGVs freed at a
    /// step are available to the pass at the same step.
    pub async fn step(&self) -> ApplicationResult<Step> {
        let now = self.now() + 1;
        self.clock.send_replace(now);

        {
            let mut board = self.missions.lock().await;
            let mut runners: Vec<&mut MissionRunner> = board.local.values_mut().collect();
            runners.sort_by(|a, b| a.agv_id().cmp(b.agv_id()));
            for runner in runners {
                if let Err(e) = runner.advance(now).await {
                    tracing::error!("Mission {} stalled at step {}: {}", runner.task_id(), now, e);
                }
            }
            let finished: Vec<TaskId> = board
                .local
                .iter()
                .filter(|(_, r)| r.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                if let Some(mut runner) = board.local.remove(&id) {
                    runner.close().await;
                }
                board.handles.remove(&id);
            }
        }

        if now % self.fleet.settings.coordinator.dispatch_every_steps() == 0 {
            let dispatched = self.dispatch(now).await?;
            let mut board = self.missions.lock().await;
            for (runner, handle) in dispatched {
                board.handles.insert(handle.task_id, handle);
                board.local.insert(runner.task_id(), runner);
            }
        }
        self.fleet.planner.prune_before(now).await;
        self.fleet.events.flush().await;
        self.archive_retired().await;
        Ok(now)
    }

    /// Run `steps` consecutive steps.
    pub async fn run_steps(&self, steps: u64) -> ApplicationResult<Step> {
        let mut now = self.now();
        for _ in 0..steps {
            now = self.step().await?;
        }
        Ok(now)
    }

    /// One dispatch pass at the current step, guarded against overlap.
    pub async fn dispatch(&self, now: Step) -> ApplicationResult<Dispatched> {
        let _guard = self.dispatch_guard.lock().await;
        self.dispatcher.run_pass(now).await
    }

    /// Real-time operation: tick the clock every `step_interval_ms`, run the
    /// dispatcher on its interval and spawn one task per mission, until
    /// `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> ApplicationResult<()>
    where
        F: Future<Output = ()>,
    {
        let settings = &self.fleet.settings.coordinator;
        let every = settings.dispatch_every_steps();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(settings.step_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(
            "Coordinator running: step {} ms, dispatch every {} steps",
            settings.step_interval_ms,
            every
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let now = self.now() + 1;
                    self.clock.send_replace(now);
                    if now % every == 0 {
                        match self.dispatch(now).await {
                            Ok(dispatched) => self.spawn_missions(dispatched).await,
                            Err(e) => tracing::error!("Dispatch pass at step {} failed: {}", now, e),
                        }
                    }
                    self.fleet.planner.prune_before(now.saturating_sub(1)).await;
                    self.fleet.events.flush().await;
                    self.archive_retired().await;
                }
            }
        }

        let mut board = self.missions.lock().await;
        for handle in board.spawned.drain(..) {
            handle.abort();
        }
        tracing::info!("Coordinator stopped at step {}", self.now());
        Ok(())
    }

    async fn spawn_missions(&self, dispatched: Dispatched) {
        let mut board = self.missions.lock().await;
        board.handles.retain(|_, h| !h.is_closed());
        board.spawned.retain(|h| !h.is_finished());
        for (runner, handle) in dispatched {
            board.handles.insert(handle.task_id, handle);
            let clock = self.clock.subscribe();
            board.spawned.push(tokio::spawn(runner.run(clock)));
        }
    }

    pub async fn agvs(&self) -> Vec<Agv> {
        self.fleet.registry.snapshot().await
    }

    pub async fn agv(&self, agv_id: &AgvId) -> Option<Agv> {
        self.fleet.registry.get(agv_id).await
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.fleet.queue.snapshot().await
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.fleet.queue.get(task_id).await
    }

    /// Remove a terminal task once its final event has gone out.
    pub async fn archive_task(&self, task_id: &TaskId) -> ApplicationResult<Task> {
        Ok(self.fleet.queue.archive(task_id).await?)
    }

    /// Drop finished Charge and Reposition tasks from memory once their
    /// missions have closed and every event has been delivered. The state
    /// store keeps them.
    async fn archive_retired(&self) {
        if self.fleet.events.pending().await > 0 {
            return;
        }
        let in_use: BTreeSet<TaskId> = {
            let board = self.missions.lock().await;
            board
                .handles
                .iter()
                .filter(|(_, h)| !h.is_closed())
                .map(|(id, _)| *id)
                .collect()
        };
        let archived = self.fleet.queue.archive_retired(&in_use).await;
        if !archived.is_empty() {
            tracing::debug!("Archived {} finished coordinator task(s)", archived.len());
        }
    }

    pub async fn active_missions(&self) -> usize {
        let board = self.missions.lock().await;
        board.local.len() + board.spawned.iter().filter(|h| !h.is_finished()).count()
    }

    pub async fn reservations(&self) -> ReservationTable {
        self.fleet.planner.snapshot().await
    }

    pub async fn reservation_conflicts(&self) -> Vec<Conflict> {
        self.fleet.planner.conflicts().await
    }

    pub async fn pending_events(&self) -> usize {
        self.fleet.events.pending().await
    }
}
