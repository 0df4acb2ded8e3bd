use super::fleet::FleetState;
use super::mission::{MissionHandle, MissionRunner};
use crate::common::{ApplicationError, ApplicationResult, DomainError};
use crate::domains::fleet::{Agv, AgvEvent, AgvId};
use crate::domains::planning::Step;
use crate::domains::tasks::{CancelOutcome, QueueState, Task, TaskEvent, TaskRequest};
use crate::domains::world::Cell;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Missions created by one dispatch pass, already through their first
/// planning attempt.
pub type Dispatched = Vec<(MissionRunner, MissionHandle)>;

/// Binds Pending tasks to AGVs and sends low AGVs to charge. Charge and
/// Reposition tasks go to the AGV they name; transports to the nearest
/// eligible AGV.
pub struct Dispatcher {
    fleet: Arc<FleetState>,
}

impl Dispatcher {
    pub fn new(fleet: Arc<FleetState>) -> Self {
        Self { fleet }
    }

    /// One full scheduling pass. Callers must not run two passes at once.
    pub async fn run_pass(&self, now: Step) -> ApplicationResult<Dispatched> {
        self.drain_idle().await?;
        self.request_charging().await?;
        self.assign_ready(now).await
    }

    async fn drain_idle(&self) -> ApplicationResult<()> {
        let amount = self.fleet.settings.battery.idle_drain
            * self.fleet.settings.coordinator.dispatch_every_steps() as f64;
        if amount <= 0.0 {
            return Ok(());
        }
        for agv in self.fleet.registry.snapshot().await {
            if !agv.is_idle() || agv.battery <= 0.0 {
                continue;
            }
            let change = self
                .fleet
                .registry
                .compare_and_set(&agv.id, agv.version, self.fleet.store.as_ref(), |a| {
                    a.drain(amount);
                    Ok(())
                })
                .await;
            match change {
                Ok(change) => self.fleet.publish_agv_change(&change).await?,
                Err(ApplicationError::Domain(DomainError::ConcurrencyConflict { .. })) => {}
                Err(ApplicationError::StateStore(e)) => {
                    tracing::warn!("Idle drain of {} not persisted: {}", agv.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Synthesize a Charge task for every idle AGV under the low threshold.
    async fn request_charging(&self) -> ApplicationResult<()> {
        let threshold = self.fleet.settings.coordinator.low_battery_threshold;
        let agvs = self.fleet.registry.snapshot().await;
        let (mut claimed, bound) = {
            let queue = self.fleet.queue.lock().await;
            (queue.claimed_stations(), self.bound_agvs(&queue, &agvs))
        };
        let occupied: BTreeSet<Cell> = agvs.iter().map(|a| a.cell).collect();

        for agv in agvs.iter().filter(|a| {
            a.is_idle() && !a.is_faulted() && a.battery < threshold && !bound.contains(&a.id)
        }) {
            // An AGV already standing on a free charger charges in place.
            let station = self
                .fleet
                .world
                .charging_stations()
                .iter()
                .copied()
                .filter(|s| !claimed.contains(s) && (*s == agv.cell || !occupied.contains(s)))
                .filter(|s| self.fleet.world.is_reachable(agv.cell, *s))
                .min_by_key(|s| (agv.cell.manhattan(s), *s));
            let Some(station) = station else {
                tracing::debug!("No free charging station for {} ({:.1}%)", agv.id, agv.battery);
                continue;
            };
            let task = self
                .fleet
                .queue
                .submit(TaskRequest::charge(agv.id.clone(), station), self.fleet.store.as_ref())
                .await?;
            claimed.insert(station);
            tracing::info!(
                "{} at {:.1}% sent to charger {} (task {})",
                agv.id,
                agv.battery,
                station,
                task.id
            );
            self.fleet
                .events
                .publish_correlated(&TaskEvent::submitted(&task), task.id.0)
                .await?;
        }
        Ok(())
    }

    async fn assign_ready(&self, now: Step) -> ApplicationResult<Dispatched> {
        let mut dispatched = Vec::new();
        let mut agvs = self.fleet.registry.snapshot().await;
        let ready = self.fleet.queue.ready_tasks().await;
        let bound = {
            let queue = self.fleet.queue.lock().await;
            self.bound_agvs(&queue, &agvs)
        };

        for task in ready {
            let chosen = match task.kind.bound_agv() {
                Some(agv_id) => {
                    if agvs.iter().any(|a| &a.id == agv_id && a.is_faulted()) {
                        self.drop_orphan(&task).await?;
                        continue;
                    }
                    agvs.iter()
                        .find(|a| &a.id == agv_id && a.is_idle())
                        .cloned()
                }
                None => {
                    let pickup = task.first_target(&self.fleet.world);
                    let chosen = pickup.and_then(|pickup| self.select_transport_agv(&agvs, &bound, pickup));
                    if chosen.is_none() {
                        tracing::debug!(
                            "{}",
                            DomainError::NoAvailableAgv { task_id: task.id }
                        );
                        break;
                    }
                    chosen
                }
            };
            let Some(agv) = chosen else {
                continue;
            };

            match self.assign(&task, &agv, now).await {
                Ok(Some(mission)) => {
                    agvs.retain(|a| a.id != agv.id);
                    dispatched.push(mission);
                }
                Ok(None) => {
                    agvs.retain(|a| a.id != agv.id);
                }
                Err(ApplicationError::StateStore(e)) => {
                    tracing::error!("Assignment of {} to {} not persisted: {}", task.id, agv.id, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatched)
    }

    /// AGVs among `agvs` with an open Charge or Reposition task.
    fn bound_agvs(&self, queue: &QueueState, agvs: &[Agv]) -> BTreeSet<AgvId> {
        agvs.iter()
            .filter(|a| queue.bound_task(&a.id).is_some())
            .map(|a| a.id.clone())
            .collect()
    }

    /// A synthesized task whose AGV faulted before it started can never run.
    async fn drop_orphan(&self, task: &Task) -> ApplicationResult<()> {
        let outcome = self.fleet.queue.cancel(&task.id, self.fleet.store.as_ref()).await?;
        if let CancelOutcome::Cancelled { task: after, previous } = outcome {
            tracing::info!("Dropped {} task {}: its AGV is faulted", after.kind.name(), after.id);
            let before = Task {
                status: previous,
                ..after.clone()
            };
            self.fleet
                .events
                .publish_correlated(&TaskEvent::status_changed(&before, &after), after.id.0)
                .await?;
        }
        Ok(())
    }

    /// Nearest eligible AGV to `pickup`, ties broken by id. AGVs in `bound`
    /// are reserved for their own Charge or Reposition task.
    pub fn select_transport_agv(
        &self,
        agvs: &[Agv],
        bound: &BTreeSet<AgvId>,
        pickup: Cell,
    ) -> Option<Agv> {
        let threshold = self.fleet.settings.coordinator.dispatch_battery_threshold;
        agvs.iter()
            .filter(|a| {
                a.is_idle()
                    && !a.is_faulted()
                    && a.battery >= threshold
                    && !bound.contains(&a.id)
                    && self.fleet.world.is_reachable(a.cell, pickup)
            })
            .min_by(|a, b| {
                a.cell
                    .manhattan(&pickup)
                    .cmp(&b.cell.manhattan(&pickup))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Persist the binding, then build the mission and make its first
    /// planning attempt. A lost race on the AGV yields `Ok(None)`.
    async fn assign(
        &self,
        task: &Task,
        agv: &Agv,
        now: Step,
    ) -> ApplicationResult<Option<(MissionRunner, MissionHandle)>> {
        let (task_change, agv_change) = match self.fleet.assign(&task.id, &agv.id, agv.version).await {
            Ok(changes) => changes,
            Err(ApplicationError::Domain(
                e @ (DomainError::ConcurrencyConflict { .. } | DomainError::AgvBusy { .. }),
            )) => {
                tracing::warn!("Skipped assigning {} to {}: {}", task.id, agv.id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            "Assigned {} task {} ({:?}) to {} at step {}",
            task.kind.name(),
            task.id,
            task.priority,
            agv.id,
            now
        );
        self.fleet.publish_task_change(&task_change).await?;
        self.fleet
            .events
            .publish(&AgvEvent::status_changed(&agv_change.0, &agv_change.1))
            .await?;

        let (mut runner, handle) = MissionRunner::new(self.fleet.clone(), &task_change.1, agv.id.clone())?;
        // The binding is durable now; a failed first attempt is retried by the mission.
        if let Err(e) = runner.start(now).await {
            tracing::warn!("First planning attempt for {} failed: {}", task.id, e);
        }
        Ok(Some((runner, handle)))
    }
}
