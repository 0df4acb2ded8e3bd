use crate::domains::tasks::{TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};

/// Which stage graph a mission follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionKind {
    Transport,
    Charge,
    Reposition,
}

impl MissionKind {
    pub fn of(kind: &TaskKind) -> Self {
        match kind {
            TaskKind::Transport { .. } => MissionKind::Transport,
            TaskKind::Charge { .. } => MissionKind::Charge,
            TaskKind::Reposition { .. } => MissionKind::Reposition,
        }
    }
}

/// Stages of one assigned task being carried out by one AGV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionStage {
    Assigned,
    EnRouteToPickup,
    AtPickup,
    Loading,
    Loaded,
    EnRouteToDropoff,
    AtDropoff,
    Unloading,
    EnRouteToCharger,
    Charging,
    EnRouteToHolding,
    Completed,
    Cancelled,
    Failed,
}

impl MissionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStage::Completed | MissionStage::Cancelled | MissionStage::Failed
        )
    }

    pub fn is_travelling(&self) -> bool {
        matches!(
            self,
            MissionStage::EnRouteToPickup
                | MissionStage::EnRouteToDropoff
                | MissionStage::EnRouteToCharger
                | MissionStage::EnRouteToHolding
        )
    }

    /// Cancelling is allowed up to, but not including, Loaded.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            MissionStage::Assigned
                | MissionStage::EnRouteToPickup
                | MissionStage::AtPickup
                | MissionStage::Loading
                | MissionStage::EnRouteToCharger
                | MissionStage::EnRouteToHolding
        )
    }

    pub fn can_transition(&self, to: MissionStage, kind: MissionKind) -> bool {
        use MissionStage::*;
        if self.is_terminal() {
            return false;
        }
        match (to, kind) {
            (Failed, _) => true,
            (Cancelled, _) => self.is_cancellable(),
            (_, MissionKind::Charge) => matches!(
                (*self, to),
                (Assigned, EnRouteToCharger)
                    | (EnRouteToCharger, Charging)
                    | (Charging, Completed)
            ),
            (_, MissionKind::Reposition) => matches!(
                (*self, to),
                (Assigned, EnRouteToHolding) | (EnRouteToHolding, Completed)
            ),
            (_, MissionKind::Transport) => matches!(
                (*self, to),
                (Assigned, EnRouteToPickup)
                    | (EnRouteToPickup, AtPickup)
                    | (AtPickup, Loading)
                    | (Loading, Loaded)
                    | (Loaded, EnRouteToDropoff)
                    | (EnRouteToDropoff, AtDropoff)
                    | (AtDropoff, Unloading)
                    | (Unloading, Completed)
            ),
        }
    }

    /// Task status reported while the mission is in this stage.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            MissionStage::Assigned => TaskStatus::Assigned,
            MissionStage::EnRouteToPickup
            | MissionStage::EnRouteToCharger
            | MissionStage::EnRouteToHolding => TaskStatus::EnRoute,
            MissionStage::AtPickup | MissionStage::Loading => TaskStatus::AtPickup,
            MissionStage::Loaded => TaskStatus::Loaded,
            MissionStage::EnRouteToDropoff | MissionStage::AtDropoff | MissionStage::Unloading => {
                TaskStatus::EnRouteDropoff
            }
            MissionStage::Charging => TaskStatus::Charging,
            MissionStage::Completed => TaskStatus::Completed,
            MissionStage::Cancelled => TaskStatus::Cancelled,
            MissionStage::Failed => TaskStatus::Failed,
        }
    }
}

/// Messages delivered to a running mission.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionCommand {
    /// A cancel request was accepted for the task; stop at the next boundary.
    Cancel,
    /// The AGV reported a hardware fault.
    Fault { reason: String },
}
