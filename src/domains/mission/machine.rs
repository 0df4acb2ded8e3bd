use super::stage::{MissionKind, MissionStage};
use crate::common::{DomainError, DomainResult};
use crate::domains::fleet::AgvId;
use crate::domains::planning::{Route, Step, Waypoint};
use crate::domains::tasks::{Task, TaskId};
use crate::domains::world::{Cell, WorldMap};

/// Outcome of a failed planning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(Step),
    Exhausted,
}

/// Pure mission bookkeeping: current stage, the route being driven, dwell
/// timers, the NoPath retry budget and how long the mission has waited on
/// parked AGVs. Side effects are applied by the application layer around it.
#[derive(Debug, Clone)]
pub struct MissionStateMachine {
    task_id: TaskId,
    agv_id: AgvId,
    kind: MissionKind,
    first_target: Cell,
    dropoff: Option<Cell>,
    stage: MissionStage,
    route: Option<Route>,
    cursor: usize,
    dwell_until: Option<Step>,
    no_path_failures: u32,
    retry_budget: u32,
    next_attempt_at: Step,
    blocked_since: Option<Step>,
    last_step: Option<Step>,
    sequence: u64,
}

impl MissionStateMachine {
    pub fn new(task: &Task, agv_id: AgvId, world: &WorldMap, retry_budget: u32) -> DomainResult<Self> {
        let first_target = task.first_target(world).ok_or_else(|| {
            DomainError::invalid_task(format!("task {} has no reachable first target", task.id))
        })?;
        let dropoff = task.dropoff_cell(world);
        let kind = MissionKind::of(&task.kind);
        if kind == MissionKind::Transport && dropoff.is_none() {
            return Err(DomainError::invalid_task(format!(
                "task {} has no dropoff",
                task.id
            )));
        }
        Ok(Self {
            task_id: task.id,
            agv_id,
            kind,
            first_target,
            dropoff,
            stage: MissionStage::Assigned,
            route: None,
            cursor: 0,
            dwell_until: None,
            no_path_failures: 0,
            retry_budget,
            next_attempt_at: 0,
            blocked_since: None,
            last_step: None,
            sequence: 0,
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn agv_id(&self) -> &AgvId {
        &self.agv_id
    }

    pub fn stage(&self) -> MissionStage {
        self.stage
    }

    pub fn kind(&self) -> MissionKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Per-mission sequence number for the next emitted event.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn no_path_failures(&self) -> u32 {
        self.no_path_failures
    }

    /// Stage the mission enters once the next route is committed.
    pub fn travel_stage(&self) -> Option<MissionStage> {
        match self.stage {
            MissionStage::Assigned => Some(match self.kind {
                MissionKind::Transport => MissionStage::EnRouteToPickup,
                MissionKind::Charge => MissionStage::EnRouteToCharger,
                MissionKind::Reposition => MissionStage::EnRouteToHolding,
            }),
            MissionStage::Loaded => Some(MissionStage::EnRouteToDropoff),
            s if s.is_travelling() => Some(s),
            _ => None,
        }
    }

    /// Cell the next or current leg leads to.
    pub fn leg_goal(&self) -> Option<Cell> {
        match self.travel_stage()? {
            MissionStage::EnRouteToPickup
            | MissionStage::EnRouteToCharger
            | MissionStage::EnRouteToHolding => Some(self.first_target),
            MissionStage::EnRouteToDropoff => self.dropoff,
            _ => None,
        }
    }

    /// Stage reached when the current leg ends.
    pub fn arrival_stage(&self) -> Option<MissionStage> {
        match self.stage {
            MissionStage::EnRouteToPickup => Some(MissionStage::AtPickup),
            MissionStage::EnRouteToDropoff => Some(MissionStage::AtDropoff),
            MissionStage::EnRouteToCharger => Some(MissionStage::Charging),
            MissionStage::EnRouteToHolding => Some(MissionStage::Completed),
            _ => None,
        }
    }

    pub fn needs_route(&self) -> bool {
        self.travel_stage().is_some() && self.route.is_none()
    }

    pub fn can_attempt_plan(&self, now: Step) -> bool {
        self.needs_route() && now >= self.next_attempt_at
    }

    pub fn transition(&mut self, to: MissionStage) -> DomainResult<MissionStage> {
        if !self.stage.can_transition(to, self.kind) {
            return Err(DomainError::InvalidTransition {
                task_id: self.task_id,
                from: self.stage.task_status(),
                to: to.task_status(),
            });
        }
        let from = self.stage;
        self.stage = to;
        if to.is_terminal() {
            self.route = None;
            self.dwell_until = None;
        }
        Ok(from)
    }

    /// Adopt a committed route. Its first waypoint is where the AGV stands.
    /// A route to the leg goal ends any wait on parked AGVs; a detour to a
    /// holding cell does not.
    pub fn set_route(&mut self, route: Route) {
        if route.goal().map(|w| w.cell) == self.leg_goal() {
            self.blocked_since = None;
        }
        self.cursor = 1;
        self.route = Some(route);
    }

    /// The current route ends at the leg goal rather than on a detour.
    pub fn route_reaches_goal(&self) -> bool {
        match &self.route {
            Some(route) => route.goal().map(|w| w.cell) == self.leg_goal(),
            None => false,
        }
    }

    /// A leg ended; the next leg starts with a fresh retry budget.
    pub fn reset_retries(&mut self) {
        self.no_path_failures = 0;
        self.next_attempt_at = 0;
        self.blocked_since = None;
    }

    pub fn drop_route(&mut self) {
        self.route = None;
        self.cursor = 0;
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// Next waypoint to drive if it is due at or before `now`.
    pub fn due_waypoint(&self, now: Step) -> Option<Waypoint> {
        let route = self.route.as_ref()?;
        route
            .waypoints
            .get(self.cursor)
            .copied()
            .filter(|w| w.step <= now)
    }

    pub fn consume_waypoint(&mut self) {
        self.cursor += 1;
    }

    /// Every waypoint of the current route has been driven.
    pub fn leg_complete(&self) -> bool {
        match &self.route {
            Some(route) => self.cursor >= route.waypoints.len(),
            None => false,
        }
    }

    pub fn start_dwell(&mut self, now: Step, steps: u64) {
        self.dwell_until = Some(now + steps);
    }

    pub fn dwell_elapsed(&self, now: Step) -> bool {
        matches!(self.dwell_until, Some(until) if now >= until)
    }

    /// Count a failed planning attempt and schedule the next one.
    pub fn record_no_path(&mut self, now: Step, backoff: u64) -> RetryDecision {
        self.no_path_failures += 1;
        if self.no_path_failures >= self.retry_budget {
            return RetryDecision::Exhausted;
        }
        self.next_attempt_at = now + backoff.max(1);
        RetryDecision::RetryAt(self.next_attempt_at)
    }

    /// The leg is held up by parked AGVs that were asked to move. Waiting does
    /// not spend the NoPath budget; it ends after `limit` steps.
    pub fn record_blocked(&mut self, now: Step, backoff: u64, limit: u64) -> RetryDecision {
        let since = *self.blocked_since.get_or_insert(now);
        if now.saturating_sub(since) >= limit {
            return RetryDecision::Exhausted;
        }
        self.next_attempt_at = now + backoff.max(1);
        RetryDecision::RetryAt(self.next_attempt_at)
    }

    /// Steps not yet processed up to and including `now`.
    pub fn pending_steps(&self, now: Step) -> std::ops::RangeInclusive<Step> {
        let first = self.last_step.map(|s| s + 1).unwrap_or(now);
        first..=now
    }

    pub fn mark_processed(&mut self, step: Step) {
        self.last_step = Some(step);
    }
}
