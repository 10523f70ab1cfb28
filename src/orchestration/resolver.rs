//! Conflict resolver: arbitrates contradictory results between tasks.
//!
//! Triggered when downstream validation flags two results as mutually
//! inconsistent (say, two workers proposing incompatible schemas for the
//! same entity). The policy is deliberately small: higher declared
//! priority wins; equal priority is escalated for human approval rather
//! than resolved automatically. No result is ever discarded without a
//! decision record in the audit trail.

use crate::clog_warn;
use crate::core::task::{Task, TaskId};
use crate::store::context::DecisionRecord;

/// The winning side of an arbitrated conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: TaskId,
    pub loser: TaskId,
    pub rationale: String,
}

/// Outcome of one arbitration.
#[derive(Debug, Clone, PartialEq)]
pub enum Arbitration {
    /// Priority decided the conflict.
    Decided(Resolution),
    /// Equal priority: both results go to human review.
    Escalated { rationale: String },
}

/// Arbitrate a flagged conflict between two tasks.
///
/// Pure decision logic; the orchestrator applies the resulting
/// transitions and persists the records. Returns the arbitration plus
/// one decision record per involved task, escalations included.
pub fn arbitrate(
    task_a: &Task,
    task_b: &Task,
    conflict: &str,
) -> (Arbitration, Vec<DecisionRecord>) {
    if task_a.priority == task_b.priority {
        let rationale = format!(
            "conflict '{}': tasks {} and {} share priority {}; escalating both for review",
            conflict,
            task_a.id.short(),
            task_b.id.short(),
            task_a.priority
        );
        clog_warn!("resolver: {}", rationale);
        let decisions = vec![
            DecisionRecord::new(task_a.id, task_a.assigned_agent, &rationale),
            DecisionRecord::new(task_b.id, task_b.assigned_agent, &rationale),
        ];
        return (Arbitration::Escalated { rationale }, decisions);
    }

    let (winner, loser) = if task_a.priority > task_b.priority {
        (task_a, task_b)
    } else {
        (task_b, task_a)
    };
    let rationale = format!(
        "conflict '{}': task {} ({}) outranks task {} ({})",
        conflict,
        winner.id.short(),
        winner.priority,
        loser.id.short(),
        loser.priority
    );
    let decisions = vec![
        DecisionRecord::new(
            winner.id,
            winner.assigned_agent,
            &format!("result kept: {}", rationale),
        ),
        DecisionRecord::new(
            loser.id,
            loser.assigned_agent,
            &format!("result discarded: {}", rationale),
        ),
    ];
    (
        Arbitration::Decided(Resolution {
            winner: winner.id,
            loser: loser.id,
            rationale,
        }),
        decisions,
    )
}
