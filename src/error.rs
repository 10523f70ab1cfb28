use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("No agent registered for capability: {0}")]
    AgentUnavailable(String),

    #[error("Agent {id} is at its concurrency limit ({limit})")]
    AgentBusy {
        id: crate::core::task::AgentId,
        limit: usize,
    },

    #[error("Task {task_id} exceeded its capability timeout of {timeout:?}")]
    CapabilityTimeout { task_id: TaskId, timeout: Duration },

    #[error("Conflict between tasks {a} and {b} could not be resolved automatically")]
    ConflictUnresolved { a: TaskId, b: TaskId },

    #[error("Stale write: expected store version {expected}, found {actual}")]
    StorageWriteConflict { expected: u64, actual: u64 },

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {task_id} is not awaiting review (status: {status})")]
    NotInReview { task_id: TaskId, status: TaskStatus },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Whether the error is transient and safe to retry internally.
    ///
    /// Transient errors are never surfaced to the caller; the component
    /// that hit them retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::AgentBusy { .. } | Error::StorageWriteConflict { .. }
        )
    }

    /// CLI exit code for this error.
    ///
    /// 1 = validation (e.g. cycle detected), 2 = not found,
    /// 3 = conflict / approval required.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TaskNotFound(_) | Error::BatchNotFound(_) => 2,
            Error::ConflictUnresolved { .. } | Error::NotInReview { .. } => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
