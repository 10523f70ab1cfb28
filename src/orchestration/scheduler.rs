//! Priority scheduler over the task graph's ready set.
//!
//! Each tick drains up to the available capacity from the ready set,
//! ordered by effective priority (highest first) with FIFO tie-breaking on
//! creation time. Tasks that wait longer than the starvation age are
//! promoted one tier per elapsed starvation window, so Low work cannot be
//! starved forever by a stream of Critical arrivals.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clog_debug;
use crate::core::graph::TaskGraph;
use crate::core::task::{Priority, TaskId};

/// One scheduling decision produced by a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub capability: String,
    /// Priority after starvation promotion, which may exceed the task's
    /// declared priority.
    pub effective_priority: Priority,
}

struct WaitEntry {
    since: Instant,
    effective: Priority,
}

/// Orders ready tasks and enforces the dispatch capacity per tick.
///
/// The scheduler is deliberately stateless about task lifecycles: the
/// graph owns readiness, the scheduler only owns ordering and starvation
/// accounting.
pub struct Scheduler {
    starvation_age: Duration,
    waiting: HashMap<TaskId, WaitEntry>,
}

impl Scheduler {
    pub fn new(starvation_age: Duration) -> Self {
        Self {
            starvation_age,
            waiting: HashMap::new(),
        }
    }

    /// Produce the next dispatches, at most `capacity` of them.
    ///
    /// Ordering is effective priority descending, then creation time
    /// ascending, then id for full determinism. Dispatched tasks are
    /// dropped from the starvation ledger; so are tasks that left the
    /// ready set for any other reason.
    pub fn tick(&mut self, graph: &TaskGraph, capacity: usize) -> Vec<Dispatch> {
        let ready = graph.ready();
        let now = Instant::now();

        // Prune entries for tasks no longer ready.
        self.waiting.retain(|id, _| ready.contains(id));

        let mut candidates: Vec<Dispatch> = Vec::with_capacity(ready.len());
        for id in &ready {
            let Some(task) = graph.get_task(id) else {
                continue;
            };
            let entry = self.waiting.entry(*id).or_insert(WaitEntry {
                since: now,
                effective: task.priority,
            });
            // Declared priority may have been raised since we first saw
            // the task; never schedule below it.
            entry.effective = entry.effective.max(task.priority);
            if now.duration_since(entry.since) >= self.starvation_age {
                let promoted = entry.effective.promote();
                if promoted != entry.effective {
                    clog_debug!(
                        "scheduler: promoting starved task {} to {}",
                        id.short(),
                        promoted
                    );
                }
                entry.effective = promoted;
                entry.since = now;
            }
            candidates.push(Dispatch {
                task_id: *id,
                capability: task.capability.clone(),
                effective_priority: entry.effective,
            });
        }

        candidates.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then_with(|| {
                    let ta = graph.get_task(&a.task_id).map(|t| t.created_at);
                    let tb = graph.get_task(&b.task_id).map(|t| t.created_at);
                    ta.cmp(&tb)
                })
                .then_with(|| a.task_id.0.cmp(&b.task_id.0))
        });
        candidates.truncate(capacity);

        for dispatch in &candidates {
            self.waiting.remove(&dispatch.task_id);
        }
        candidates
    }

    /// Number of tasks currently tracked for starvation accounting.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}
