use super::fleet::{FleetState, StageCommit};
use crate::common::{ApplicationResult, DomainError};
use crate::domains::fleet::{AgvEvent, AgvId, AgvStatus};
use crate::domains::mission::{
    MissionCommand, MissionEvent, MissionKind, MissionStage, MissionStateMachine, RetryDecision,
};
use crate::domains::planning::{Blockage, Route, Step};
use crate::domains::tasks::{Task, TaskId, TaskStatus};
use crate::domains::world::Cell;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Sending half of a mission's command channel.
#[derive(Debug, Clone)]
pub struct MissionHandle {
    pub task_id: TaskId,
    pub agv_id: AgvId,
    sender: mpsc::Sender<MissionCommand>,
}

impl MissionHandle {
    /// Returns false if the mission has already ended.
    pub async fn send(&self, command: MissionCommand) -> bool {
        self.sender.send(command).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Drives one [`MissionStateMachine`] against the shared fleet state, one
/// step at a time.
pub struct MissionRunner {
    fleet: Arc<FleetState>,
    machine: MissionStateMachine,
    commands: mpsc::Receiver<MissionCommand>,
}

impl MissionRunner {
    pub fn new(fleet: Arc<FleetState>, task: &Task, agv_id: AgvId) -> ApplicationResult<(Self, MissionHandle)> {
        let machine = MissionStateMachine::new(
            task,
            agv_id.clone(),
            &fleet.world,
            fleet.settings.coordinator.no_path_retry_budget,
        )?;
        let (sender, commands) = mpsc::channel(8);
        let handle = MissionHandle {
            task_id: task.id,
            agv_id,
            sender,
        };
        Ok((
            Self {
                fleet,
                machine,
                commands,
            },
            handle,
        ))
    }

    pub fn task_id(&self) -> TaskId {
        self.machine.task_id()
    }

    pub fn agv_id(&self) -> &AgvId {
        self.machine.agv_id()
    }

    pub fn stage(&self) -> MissionStage {
        self.machine.stage()
    }

    pub fn is_finished(&self) -> bool {
        self.machine.is_finished()
    }

    /// First planning attempt, made right after assignment.
    pub async fn start(&mut self, now: Step) -> ApplicationResult<()> {
        let result = self.tick(now).await;
        self.machine.mark_processed(now);
        result
    }

    /// Process every step up to `now` that has not been processed yet.
    pub async fn advance(&mut self, now: Step) -> ApplicationResult<()> {
        for step in self.machine.pending_steps(now) {
            if self.machine.is_finished() {
                break;
            }
            self.tick(step).await?;
            self.machine.mark_processed(step);
        }
        Ok(())
    }

    /// Follow the coordinator clock until the mission ends.
    pub async fn run(mut self, mut clock: watch::Receiver<Step>) {
        loop {
            let now = *clock.borrow_and_update();
            if let Err(e) = self.advance(now).await {
                tracing::error!("Mission {} stalled at step {}: {}", self.task_id(), now, e);
            }
            if self.machine.is_finished() || clock.changed().await.is_err() {
                break;
            }
        }
        self.close().await;
    }

    /// Stop accepting commands; a fault that arrived too late to reach the
    /// mission is applied to the AGV directly.
    pub async fn close(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let MissionCommand::Fault { reason } = command {
                if let Err(e) = self.fault_idle_agv(&reason).await {
                    tracing::error!("Failed to fault AGV {}: {}", self.agv_id(), e);
                }
            }
        }
    }

    async fn fault_idle_agv(&self, reason: &str) -> ApplicationResult<()> {
        let (task, agv) = self.fleet.fault_agv(self.machine.agv_id(), reason).await?;
        if let Some(task) = &task {
            self.fleet.publish_task_change(task).await?;
        }
        self.fleet.publish_agv_change(&agv).await?;
        self.fleet
            .events
            .publish(&AgvEvent::faulted(&agv.1, agv.0.current_task_id))
            .await
    }

    async fn tick(&mut self, now: Step) -> ApplicationResult<()> {
        let mut cancel_requested = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MissionCommand::Fault { reason } => return self.fault(now, &reason).await,
                MissionCommand::Cancel => {
                    tracing::debug!(
                        "Mission {} noted cancel request in {:?}",
                        self.task_id(),
                        self.stage()
                    );
                    cancel_requested = true;
                }
            }
        }
        // Without a route there is no boundary to wait for.
        if cancel_requested && self.abort_unrouted(now).await? {
            return Ok(());
        }

        match self.machine.stage() {
            MissionStage::Assigned | MissionStage::Loaded => {
                if self.machine.can_attempt_plan(now) {
                    self.plan_leg(now).await?;
                }
            }
            stage if stage.is_travelling() => {
                if self.machine.needs_route() {
                    if self.machine.can_attempt_plan(now) {
                        self.plan_leg(now).await?;
                    }
                } else {
                    self.drive(now).await?;
                }
            }
            MissionStage::Loading | MissionStage::Unloading => self.dwell(now).await?,
            MissionStage::Charging => self.charge(now).await?,
            _ => {}
        }
        Ok(())
    }

    /// Stop a cancellable mission that has no route yet once its task is
    /// cancelled. Returns whether the mission ended.
    async fn abort_unrouted(&mut self, now: Step) -> ApplicationResult<bool> {
        if !self.machine.needs_route() || !self.machine.stage().is_cancellable() {
            return Ok(false);
        }
        let cancelled = self
            .fleet
            .queue
            .get(&self.task_id())
            .await
            .is_some_and(|t| t.is_terminal() || t.abort_requested);
        if !cancelled {
            return Ok(false);
        }
        let agv_id = self.machine.agv_id().clone();
        let commit = self
            .fleet
            .commit_stage(&self.task_id(), &agv_id, true, |_| Ok(()), |_| Ok(()))
            .await?;
        self.fleet.publish_stage_commit(&commit).await?;
        let StageCommit::Aborted { agv, .. } = commit else {
            return Ok(false);
        };
        self.fleet.planner.release(&agv_id, agv.1.cell, now).await;
        self.finish(now, MissionStage::Cancelled).await?;
        Ok(true)
    }

    async fn plan_leg(&mut self, now: Step) -> ApplicationResult<()> {
        if self.abort_unrouted(now).await? {
            return Ok(());
        }
        let (Some(goal), Some(travel)) = (self.machine.leg_goal(), self.machine.travel_stage()) else {
            return Ok(());
        };
        let agv_id = self.machine.agv_id().clone();
        let from = match self.fleet.registry.get(&agv_id).await {
            Some(agv) => agv.cell,
            None => return Err(DomainError::AgvNotFound { agv_id }.into()),
        };

        match self.fleet.planner.plan(&agv_id, from, goal, now).await {
            Ok(route) => self.follow(now, from, travel, route).await,
            Err(DomainError::NoPath { .. } | DomainError::GoalOccupied { .. }) => {
                let blockage = match self.machine.kind() {
                    MissionKind::Reposition => None,
                    _ => self.fleet.planner.blockage(&agv_id, from, goal).await,
                };
                match blockage {
                    Some(blockage) if !blockage.parked.is_empty() => {
                        self.wait_for_way(now, from, goal, travel, blockage).await
                    }
                    _ => self.retry_no_path(now, from, goal).await,
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retry_no_path(&mut self, now: Step, from: Cell, goal: Cell) -> ApplicationResult<()> {
        let backoff = self.fleet.settings.coordinator.dispatch_every_steps();
        match self.machine.record_no_path(now, backoff) {
            RetryDecision::RetryAt(at) => {
                tracing::warn!(
                    "No path for {} from {} to {} (attempt {}), retrying at step {}",
                    self.machine.agv_id(),
                    from,
                    goal,
                    self.machine.no_path_failures(),
                    at
                );
                Ok(())
            }
            RetryDecision::Exhausted => {
                let reason = format!(
                    "no path from {} to {} after {} attempts",
                    from,
                    goal,
                    self.machine.no_path_failures()
                );
                self.fail(now, &reason).await
            }
        }
    }

    /// Parked AGVs stand between this AGV and its goal. Idle ones are asked
    /// to move. If one of them cannot be moved and this AGV sits on a work
    /// cell it does not need, it steps aside to a holding cell so that it
    /// cannot be the one holding the others up.
    async fn wait_for_way(
        &mut self,
        now: Step,
        from: Cell,
        goal: Cell,
        travel: MissionStage,
        blockage: Blockage,
    ) -> ApplicationResult<()> {
        let agv_id = self.machine.agv_id().clone();
        let mut all_moving = true;
        for occupant in &blockage.parked {
            match self.fleet.request_yield(occupant, &blockage.path).await {
                Ok(moving) => all_moving &= moving,
                Err(e) => {
                    all_moving = false;
                    tracing::warn!("Could not move {} out of the way of {}: {}", occupant, agv_id, e);
                }
            }
        }

        if !all_moving && from != goal && self.fleet.world.is_work_cell(from) {
            if let Some(detour) = self.step_aside(now, from, &blockage.path).await? {
                tracing::info!(
                    "{} steps aside from {} while the way to {} is held",
                    agv_id,
                    from,
                    goal
                );
                return self.follow(now, from, travel, detour).await;
            }
        }

        let backoff = self.fleet.settings.coordinator.dispatch_every_steps();
        let limit = self.fleet.settings.coordinator.blocked_wait_limit_steps;
        match self.machine.record_blocked(now, backoff, limit) {
            RetryDecision::RetryAt(at) => {
                tracing::debug!(
                    "{} waits for {:?} to clear the way to {}, retrying at step {}",
                    agv_id,
                    blockage.parked,
                    goal,
                    at
                );
                Ok(())
            }
            RetryDecision::Exhausted => {
                let holders: Vec<String> = blockage.parked.iter().map(|id| id.to_string()).collect();
                let reason = format!(
                    "way from {} to {} held by {} for {} steps",
                    from,
                    goal,
                    holders.join(", "),
                    limit
                );
                self.fail(now, &reason).await
            }
        }
    }

    async fn step_aside(&self, now: Step, from: Cell, keep_clear: &[Cell]) -> ApplicationResult<Option<Route>> {
        let agv_id = self.machine.agv_id();
        let taken = self.fleet.queue.lock().await.holding_targets();
        let Some(holding) = self
            .fleet
            .planner
            .holding_cell(agv_id, from, keep_clear, &taken)
            .await
        else {
            return Ok(None);
        };
        match self.fleet.planner.plan(agv_id, from, holding, now).await {
            Ok(route) => Ok(Some(route)),
            Err(DomainError::NoPath { .. } | DomainError::GoalOccupied { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Adopt a committed route, entering the travel stage first if needed.
    async fn follow(&mut self, now: Step, from: Cell, travel: MissionStage, route: Route) -> ApplicationResult<()> {
        let agv_id = self.machine.agv_id().clone();
        if self.machine.stage() != travel {
            let honor_abort = self.machine.stage().is_cancellable();
            let commit = self
                .fleet
                .commit_stage(
                    &self.task_id(),
                    &agv_id,
                    honor_abort,
                    |task| task.transition(travel.task_status()),
                    |agv| {
                        agv.status = AgvStatus::Moving;
                        Ok(())
                    },
                )
                .await;
            let commit = match commit {
                Ok(commit) => commit,
                Err(e) => {
                    self.fleet.planner.release(&agv_id, from, now).await;
                    return Err(e);
                }
            };
            self.fleet.publish_stage_commit(&commit).await?;
            if let StageCommit::Aborted { .. } = commit {
                self.fleet.planner.release(&agv_id, from, now).await;
                return self.finish(now, MissionStage::Cancelled).await;
            }
            self.enter(now, travel).await?;
        }

        let sequence = self.machine.next_sequence();
        self.publish_mission(MissionEvent::RouteCommitted {
            task_id: self.task_id(),
            agv_id: agv_id.clone(),
            from,
            to: route.goal().map(|w| w.cell).unwrap_or(from),
            departure: route.start().map(|w| w.step).unwrap_or(now),
            arrival: route.arrival_step().unwrap_or(now),
            sequence,
            timestamp: Utc::now(),
        })
        .await?;
        self.machine.set_route(route);
        if self.machine.leg_complete() {
            self.end_of_route(now).await?;
        }
        Ok(())
    }

    /// The route has been driven to its end: either the leg goal or a
    /// holding cell, where the mission waits to plan the leg again.
    async fn end_of_route(&mut self, now: Step) -> ApplicationResult<()> {
        if self.machine.route_reaches_goal() {
            return self.arrive(now).await;
        }
        self.machine.drop_route();
        Ok(())
    }

    async fn drive(&mut self, now: Step) -> ApplicationResult<()> {
        let agv_id = self.machine.agv_id().clone();
        while let Some(waypoint) = self.machine.due_waypoint(now) {
            let Some(current) = self.fleet.registry.get(&agv_id).await else {
                return Err(DomainError::AgvNotFound { agv_id }.into());
            };
            if waypoint.cell != current.cell
                && self
                    .fleet
                    .planner
                    .is_blocked(&agv_id, waypoint.cell, waypoint.step)
                    .await
            {
                tracing::warn!(
                    "{} blocked ahead at {} step {}, re-planning",
                    agv_id,
                    waypoint.cell,
                    waypoint.step
                );
                self.fleet.planner.release(&agv_id, current.cell, now).await;
                self.machine.drop_route();
                if let RetryDecision::Exhausted = self.machine.record_no_path(now, 0) {
                    let reason = format!("route blocked at {} and retry budget spent", waypoint.cell);
                    return self.fail(now, &reason).await;
                }
                return self.plan_leg(now).await;
            }

            let position = self.fleet.world.position(waypoint.cell);
            let drain = self.fleet.settings.battery.move_drain;
            let speed = self.fleet.travel_speed_mps();
            let (before, after) = self
                .fleet
                .registry
                .commit(&agv_id, self.fleet.store.as_ref(), |agv| {
                    agv.move_to(waypoint.cell, position);
                    agv.speed_mps = if waypoint.cell != current.cell { speed } else { 0.0 };
                    agv.drain(drain);
                    Ok(())
                })
                .await?;
            self.machine.consume_waypoint();
            if before.cell != after.cell {
                self.fleet
                    .events
                    .publish(&AgvEvent::moved(&after, before.cell, waypoint.step))
                    .await?;
                tracing::debug!("{} {} -> {} at step {}", agv_id, before.cell, after.cell, waypoint.step);
            }
            if before.battery.floor() != after.battery.floor() {
                self.fleet
                    .events
                    .publish(&AgvEvent::battery_changed(&after))
                    .await?;
            }
            if after.is_depleted() {
                return self.fault(now, "battery depleted while moving").await;
            }
        }
        if self.machine.leg_complete() {
            self.end_of_route(now).await?;
        }
        Ok(())
    }

    async fn arrive(&mut self, now: Step) -> ApplicationResult<()> {
        let Some(next) = self.machine.arrival_stage() else {
            return Ok(());
        };
        if next == MissionStage::Completed {
            self.machine.drop_route();
            self.machine.reset_retries();
            return self.complete(now).await;
        }
        let honor_abort = self.machine.stage().is_cancellable();
        let agv_status = if next == MissionStage::Charging {
            AgvStatus::Charging
        } else {
            AgvStatus::ExecutingMission
        };
        let commit = self
            .fleet
            .commit_stage(
                &self.task_id(),
                self.machine.agv_id(),
                honor_abort,
                |task| {
                    if task.status != next.task_status() {
                        task.transition(next.task_status())?;
                    }
                    Ok(())
                },
                |agv| {
                    agv.status = agv_status;
                    agv.speed_mps = 0.0;
                    Ok(())
                },
            )
            .await?;
        self.fleet.publish_stage_commit(&commit).await?;
        self.machine.drop_route();
        self.machine.reset_retries();
        if let StageCommit::Aborted { .. } = commit {
            return self.finish(now, MissionStage::Cancelled).await;
        }
        self.enter(now, next).await?;

        match next {
            MissionStage::AtPickup => {
                self.enter(now, MissionStage::Loading).await?;
                self.machine.start_dwell(now, self.fleet.settings.load_steps());
            }
            MissionStage::AtDropoff => {
                self.enter(now, MissionStage::Unloading).await?;
                self.machine.start_dwell(now, self.fleet.settings.unload_steps());
            }
            _ => {}
        }
        Ok(())
    }

    async fn dwell(&mut self, now: Step) -> ApplicationResult<()> {
        let drain = self.fleet.settings.battery.dwell_drain;
        let change = self
            .fleet
            .registry
            .commit(self.machine.agv_id(), self.fleet.store.as_ref(), |agv| {
                agv.drain(drain);
                Ok(())
            })
            .await?;
        self.fleet.publish_agv_change(&change).await?;
        if change.1.is_depleted() {
            return self.fault(now, "battery depleted while handling load").await;
        }
        if !self.machine.dwell_elapsed(now) {
            return Ok(());
        }

        match self.machine.stage() {
            MissionStage::Loading => {
                let commit = self
                    .fleet
                    .commit_stage(
                        &self.task_id(),
                        self.machine.agv_id(),
                        true,
                        |task| task.transition(TaskStatus::Loaded),
                        |_| Ok(()),
                    )
                    .await?;
                self.fleet.publish_stage_commit(&commit).await?;
                if let StageCommit::Aborted { .. } = commit {
                    return self.finish(now, MissionStage::Cancelled).await;
                }
                self.enter(now, MissionStage::Loaded).await?;
                self.plan_leg(now).await
            }
            MissionStage::Unloading => self.complete(now).await,
            _ => Ok(()),
        }
    }

    async fn charge(&mut self, now: Step) -> ApplicationResult<()> {
        let rate = self.fleet.settings.battery.charge_rate;
        let change = self
            .fleet
            .registry
            .commit(self.machine.agv_id(), self.fleet.store.as_ref(), |agv| {
                agv.charge(rate);
                Ok(())
            })
            .await?;
        self.fleet.publish_agv_change(&change).await?;
        if change.1.battery >= self.fleet.settings.battery.charge_release_level {
            self.complete(now).await?;
        }
        Ok(())
    }

    async fn complete(&mut self, now: Step) -> ApplicationResult<()> {
        let commit = self
            .fleet
            .commit_stage(
                &self.task_id(),
                self.machine.agv_id(),
                false,
                |task| task.transition(TaskStatus::Completed),
                |agv| {
                    agv.status = AgvStatus::Idle;
                    agv.current_task_id = None;
                    agv.speed_mps = 0.0;
                    Ok(())
                },
            )
            .await?;
        self.fleet.publish_stage_commit(&commit).await?;
        let stage = match commit {
            StageCommit::Committed { .. } => MissionStage::Completed,
            StageCommit::Aborted { .. } => MissionStage::Cancelled,
        };
        self.finish(now, stage).await
    }

    async fn fail(&mut self, now: Step, reason: &str) -> ApplicationResult<()> {
        let agv_id = self.machine.agv_id().clone();
        let commit = self
            .fleet
            .commit_stage(
                &self.task_id(),
                &agv_id,
                false,
                |task| task.fail(reason),
                |agv| {
                    agv.status = AgvStatus::Idle;
                    agv.current_task_id = None;
                    agv.speed_mps = 0.0;
                    Ok(())
                },
            )
            .await?;
        self.fleet.publish_stage_commit(&commit).await?;
        let (agv, aborted) = match &commit {
            StageCommit::Committed { agv, .. } => (&agv.1, false),
            StageCommit::Aborted { agv, .. } => (&agv.1, true),
        };
        self.fleet.planner.release(&agv_id, agv.cell, now).await;
        if aborted {
            tracing::info!(
                "Mission {} on {} stopped for its cancelled task instead of failing: {}",
                self.task_id(),
                agv_id,
                reason
            );
            return self.finish(now, MissionStage::Cancelled).await;
        }
        tracing::error!("Mission {} failed on {}: {}", self.task_id(), agv_id, reason);
        self.publish_failure(now, reason).await?;
        self.finish(now, MissionStage::Failed).await
    }

    async fn fault(&mut self, now: Step, reason: &str) -> ApplicationResult<()> {
        let (task, agv) = self.fleet.fault_agv(self.machine.agv_id(), reason).await?;
        if let Some(task) = &task {
            self.fleet.publish_task_change(task).await?;
        }
        self.fleet.publish_agv_change(&agv).await?;
        self.fleet
            .events
            .publish(&AgvEvent::faulted(&agv.1, Some(self.task_id())))
            .await?;
        self.publish_failure(now, reason).await?;
        self.finish(now, MissionStage::Failed).await
    }

    async fn publish_failure(&mut self, now: Step, reason: &str) -> ApplicationResult<()> {
        let sequence = self.machine.next_sequence();
        self.publish_mission(MissionEvent::Failed {
            task_id: self.task_id(),
            agv_id: self.machine.agv_id().clone(),
            stage: self.machine.stage(),
            reason: reason.to_string(),
            step: now,
            sequence,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Move the machine to a terminal stage.
    async fn finish(&mut self, now: Step, stage: MissionStage) -> ApplicationResult<()> {
        if self.machine.is_finished() {
            return Ok(());
        }
        let stage = if self.machine.stage().can_transition(stage, self.machine.kind()) {
            stage
        } else {
            MissionStage::Failed
        };
        self.enter(now, stage).await?;
        tracing::info!(
            "Mission {} on {} ended {:?} at step {}",
            self.task_id(),
            self.machine.agv_id(),
            stage,
            now
        );
        Ok(())
    }

    async fn enter(&mut self, now: Step, to: MissionStage) -> ApplicationResult<()> {
        let from = self.machine.transition(to)?;
        tracing::info!(
            "Mission {} ({}) {:?} -> {:?}",
            self.task_id(),
            self.machine.agv_id(),
            from,
            to
        );
        let sequence = self.machine.next_sequence();
        self.publish_mission(MissionEvent::StageChanged {
            task_id: self.task_id(),
            agv_id: self.machine.agv_id().clone(),
            from,
            to,
            step: now,
            sequence,
            timestamp: Utc::now(),
        })
        .await
    }

    async fn publish_mission(&self, event: MissionEvent) -> ApplicationResult<()> {
        self.fleet
            .events
            .publish_correlated(&event, self.task_id().0)
            .await
    }
}
