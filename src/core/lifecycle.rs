//! Task lifecycle state machine.
//!
//! The authoritative per-task status transitions. Every status change in
//! the system goes through [`apply`], which rejects anything not in the
//! legal-transition table. The Context Store writes the resulting
//! [`TransitionRecord`] ahead of the bus publish, so a crash between the
//! two is recoverable by replaying unpublished records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// A single applied status transition, as persisted in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Task whose status changed.
    pub task_id: TaskId,
    /// Status before the transition.
    pub from: TaskStatus,
    /// Status after the transition.
    pub to: TaskStatus,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
    /// Whether the corresponding bus publish has been acknowledged.
    pub published: bool,
}

/// Check whether a status transition is legal, ignoring retry accounting.
///
/// `Error -> InProgress` is legal here; whether a particular task may
/// still retry depends on its attempts and is checked in [`apply`].
pub fn can_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    use TaskStatus::*;
    match (from, to) {
        // Scheduler claims a ready task.
        (Pending, InProgress) => true,
        // Worker outcomes.
        (InProgress, Review) => true,
        (InProgress, Completed) => true,
        (InProgress, Blocked { .. }) => true,
        (InProgress, Error) => true,
        // Precondition resolved.
        (Blocked { .. }, InProgress) => true,
        // Gated approval.
        (Review, Completed) => true,
        (Review, InProgress) => true,
        // Retry.
        (Error, InProgress) => true,
        // Any non-terminal state can be cancelled.
        (Pending, Cancelled)
        | (InProgress, Cancelled)
        | (Blocked { .. }, Cancelled)
        | (Review, Cancelled)
        | (Error, Cancelled) => true,
        _ => false,
    }
}

/// Apply a status transition to a task, enforcing the full invariant set.
///
/// Rejects transitions out of terminal states (including Error with
/// exhausted attempts) and anything absent from the transition table.
/// Returns the record to be written to the WAL.
pub fn apply(task: &mut Task, to: TaskStatus) -> Result<TransitionRecord> {
    if task.is_terminal() {
        return Err(Error::InvalidTransition {
            from: task.status.clone(),
            to,
        });
    }
    if !can_transition(&task.status, &to) {
        return Err(Error::InvalidTransition {
            from: task.status.clone(),
            to,
        });
    }

    let from = std::mem::replace(&mut task.status, to.clone());
    task.updated_at = Utc::now();

    Ok(TransitionRecord {
        task_id: task.id,
        from,
        to,
        at: task.updated_at,
        published: false,
    })
}
