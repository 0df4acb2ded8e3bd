use crate::domains::fleet::AgvId;
use crate::domains::tasks::{TaskId, TaskStatus};
use crate::domains::world::Cell;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error("No available AGV for task {task_id}")]
    NoAvailableAgv { task_id: TaskId },

    #[error("No path from {from} to {to} within {horizon} steps")]
    NoPath { from: Cell, to: Cell, horizon: u64 },

    #[error("Task {task_id} is {status:?} and cannot be cancelled")]
    NotCancellable { task_id: TaskId, status: TaskStatus },

    #[error("Task {task_id} is already loaded and cannot be cancelled")]
    CannotCancelLoaded { task_id: TaskId },

    #[error("AGV {agv_id} faulted: {reason}")]
    AgvFault { agv_id: AgvId, reason: String },

    #[error("AGV {agv_id} is busy: {detail}")]
    AgvBusy { agv_id: AgvId, detail: String },

    #[error("Goal {cell} is held by parked AGV {agv_id}")]
    GoalOccupied { cell: Cell, agv_id: AgvId },

    #[error("Illegal transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("AGV not found: {agv_id}")]
    AgvNotFound { agv_id: AgvId },

    #[error("Concurrency conflict on {entity}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("Reservation conflict for AGV {agv_id} at {cell} step {step}")]
    ReservationConflict { agv_id: AgvId, cell: Cell, step: u64 },

    #[error("Layout error: {reason}")]
    Layout { reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),
}

impl DomainError {
    pub fn invalid_task(reason: impl Into<String>) -> Self {
        DomainError::InvalidTask {
            reason: reason.into(),
        }
    }

    pub fn layout(reason: impl Into<String>) -> Self {
        DomainError::Layout {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] anyhow::Error),
}

impl ApplicationError {
    /// The domain error behind this failure, if any.
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            ApplicationError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
pub type ApplicationResult<T> = Result<T, ApplicationError>;
