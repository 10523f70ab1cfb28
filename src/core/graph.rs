//! Task graph manager for dependency-aware scheduling.
//!
//! Maintains the dependency DAG over tasks, validates acyclicity at
//! submission time (Kahn's algorithm, whole batch rejected atomically),
//! and answers "ready" queries incrementally: a completion re-evaluates
//! only the direct dependents of the completed task, keeping the check
//! O(out-degree) per completion instead of O(n) per poll.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::lifecycle::{self, TransitionRecord};
use crate::core::task::{BatchId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a` and may not
/// start until `a` is Completed. Alongside the petgraph storage the manager
/// maintains the ready set and advisory holds placed by
/// [`TaskGraph::mark_dependents_blocked`].
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Pending tasks whose dependencies are all Completed.
    ready: HashSet<TaskId>,
    /// Advisory holds: dependent task -> the task that caused the hold.
    /// Held tasks stay Pending but are excluded from ready().
    held: HashMap<TaskId, TaskId>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            ready: HashSet::new(),
            held: HashMap::new(),
        }
    }

    /// Submit a batch of tasks with dependency edges.
    ///
    /// Edges are `(dependency, dependent)` pairs and are merged with each
    /// task's `depends_on` set. The whole batch is validated with Kahn's
    /// algorithm against the combined (existing + new) graph before any
    /// mutation; a cycle rejects the entire batch and leaves the graph
    /// untouched.
    ///
    /// All tasks in the batch are stamped with the same fresh `BatchId`,
    /// which is returned.
    ///
    /// # Errors
    /// - `CycleDetected` if the combined graph would contain a cycle
    /// - `Validation` if a task id repeats or an edge references an
    ///   unknown task
    pub fn submit_batch(
        &mut self,
        mut tasks: Vec<Task>,
        edges: Vec<(TaskId, TaskId)>,
    ) -> Result<BatchId> {
        let batch_id = BatchId::new();

        // Collect the candidate node set: everything already in the graph
        // plus the new tasks.
        let mut new_ids = HashSet::new();
        for task in &tasks {
            if self.task_index.contains_key(&task.id) || !new_ids.insert(task.id) {
                return Err(Error::Validation(format!(
                    "Duplicate task id in submission: {}",
                    task.id
                )));
            }
        }

        // Merge explicit edges into each task's depends_on so the record
        // is self-describing (checkpoints rebuild edges from depends_on).
        let mut by_id: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        for (from, to) in &edges {
            let Some(&idx) = by_id.get(to) else {
                return Err(Error::Validation(format!(
                    "Edge target {} is not part of the submitted batch",
                    to
                )));
            };
            tasks[idx].depends_on.insert(*from);
        }

        // Every dependency must resolve to an existing or in-batch task.
        for task in &tasks {
            for dep in &task.depends_on {
                if !self.task_index.contains_key(dep) && !new_ids.contains(dep) {
                    return Err(Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id.short(),
                        dep.short()
                    )));
                }
            }
        }

        self.check_acyclic(&tasks)?;

        // Validation passed: commit the batch.
        for task in &mut tasks {
            task.batch_id = batch_id;
        }
        for task in tasks {
            let id = task.id;
            let index = self.graph.add_node(task);
            self.task_index.insert(id, index);
        }
        let ids: Vec<TaskId> = by_id.drain().map(|(id, _)| id).collect();
        for id in &ids {
            let index = self.task_index[id];
            let deps: Vec<TaskId> = self.graph[index].depends_on.iter().copied().collect();
            for dep in deps {
                let dep_index = self.task_index[&dep];
                if self.graph.find_edge(dep_index, index).is_none() {
                    self.graph.add_edge(dep_index, index, ());
                }
            }
        }

        // Seed the ready set with dependency-free (or already-satisfied)
        // new tasks.
        for id in ids {
            if self.is_ready(&id) {
                self.ready.insert(id);
            }
        }

        Ok(batch_id)
    }

    /// Kahn's algorithm over the existing graph plus the candidate batch.
    ///
    /// Runs entirely on id maps so a rejection never mutates the graph.
    fn check_acyclic(&self, candidates: &[Task]) -> Result<()> {
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut indegree: HashMap<TaskId, usize> = HashMap::new();

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            indegree.entry(task.id).or_insert(0);
            for dep_index in self.graph.neighbors_directed(index, Direction::Incoming) {
                let dep = self.graph[dep_index].id;
                dependents.entry(dep).or_default().push(task.id);
                *indegree.entry(task.id).or_insert(0) += 1;
            }
        }
        for task in candidates {
            indegree.entry(task.id).or_insert(0);
            for dep in &task.depends_on {
                dependents.entry(*dep).or_default().push(task.id);
                *indegree.entry(task.id).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<TaskId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            if let Some(deps) = dependents.get(&id) {
                for dependent in deps {
                    let d = indegree.get_mut(dependent).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if processed < indegree.len() {
            let mut stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(id, _)| id.short())
                .collect();
            stuck.sort();
            return Err(Error::CycleDetected(format!(
                "tasks involved: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    /// Whether a task is Pending with every dependency Completed and no
    /// advisory hold.
    fn is_ready(&self, id: &TaskId) -> bool {
        let Some(&index) = self.task_index.get(id) else {
            return false;
        };
        let task = &self.graph[index];
        if task.status != TaskStatus::Pending || self.held.contains_key(id) {
            return false;
        }
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| self.graph[dep].status == TaskStatus::Completed)
    }

    /// Tasks ready to be scheduled, oldest first for deterministic order.
    pub fn ready(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.ready.iter().copied().collect();
        ids.sort_by_key(|id| {
            let task = &self.graph[self.task_index[id]];
            (task.created_at, task.id.0)
        });
        ids
    }

    /// Apply a lifecycle transition to a task and maintain the ready set.
    ///
    /// On a Completed transition only the direct dependents of the task
    /// are re-evaluated. Returns the transition record for the write-ahead
    /// log.
    pub fn apply_transition(&mut self, id: &TaskId, to: TaskStatus) -> Result<TransitionRecord> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound(*id))?;

        let record = lifecycle::apply(&mut self.graph[index], to.clone())?;

        // A task that leaves Pending is no longer schedulable.
        if record.from == TaskStatus::Pending {
            self.ready.remove(id);
        }

        if to == TaskStatus::Completed {
            self.held.retain(|_, blocker| blocker != id);
            let dependents: Vec<TaskId> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|n| self.graph[n].id)
                .collect();
            for dependent in dependents {
                if self.is_ready(&dependent) {
                    self.ready.insert(dependent);
                }
            }
        }

        Ok(record)
    }

    /// Place an advisory hold on the direct dependents of a task.
    ///
    /// Held tasks keep their Pending status but are excluded from
    /// `ready()` until the hold is released (by the blocker completing or
    /// an explicit [`TaskGraph::release_holds`]). Returns the held ids.
    pub fn mark_dependents_blocked(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound(*id))?;

        let dependents: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .filter(|d| self.graph[self.task_index[d]].status == TaskStatus::Pending)
            .collect();
        for dependent in &dependents {
            self.held.insert(*dependent, *id);
            self.ready.remove(dependent);
        }
        Ok(dependents)
    }

    /// Release every advisory hold attributed to the given blocker.
    pub fn release_holds(&mut self, blocker: &TaskId) {
        let released: Vec<TaskId> = self
            .held
            .iter()
            .filter(|(_, b)| *b == blocker)
            .map(|(id, _)| *id)
            .collect();
        for id in released {
            self.held.remove(&id);
            if self.is_ready(&id) {
                self.ready.insert(id);
            }
        }
    }

    /// Cancel a task and all of its transitive dependents.
    ///
    /// Used when a dependency becomes permanently Error or is explicitly
    /// cancelled. Terminal tasks are skipped. Returns the transition
    /// records in cancellation order.
    pub fn cascade_cancel(&mut self, id: &TaskId) -> Result<Vec<TransitionRecord>> {
        let start = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound(*id))?;

        // BFS over dependents, root first.
        let mut order = vec![*id];
        let mut seen: HashSet<TaskId> = order.iter().copied().collect();
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let dep_id = self.graph[dependent].id;
                if seen.insert(dep_id) {
                    order.push(dep_id);
                    queue.push_back(dependent);
                }
            }
        }

        let mut records = Vec::new();
        for task_id in order {
            let index = self.task_index[&task_id];
            if self.graph[index].is_terminal() {
                continue;
            }
            records.push(self.apply_transition(&task_id, TaskStatus::Cancelled)?);
            self.held.remove(&task_id);
        }
        Ok(records)
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .map(|&index| &self.graph[index])
    }

    /// Get a mutable reference to a task by its ID.
    ///
    /// Status must not be changed through this; use
    /// [`TaskGraph::apply_transition`].
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            Some(&mut self.graph[index])
        } else {
            None
        }
    }

    /// Direct dependencies (tasks this one waits on).
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// Direct dependents (tasks waiting on this one).
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    fn neighbor_ids(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, dir)
                .map(|n| self.graph[n].id)
                .collect()
        } else {
            Vec::new()
        }
    }

    /// All tasks in the graph.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// All tasks submitted under the given batch.
    pub fn tasks_in_batch(&self, batch_id: &BatchId) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| t.batch_id == *batch_id)
            .collect()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Whether every task in a batch is terminal.
    pub fn batch_settled(&self, batch_id: &BatchId) -> bool {
        self.tasks_in_batch(batch_id)
            .iter()
            .all(|t| t.is_terminal())
    }

    /// Owned copies of every task, for checkpointing.
    ///
    /// Edges are not captured separately: each task's `depends_on` set is
    /// the authoritative edge list and `restore` rebuilds from it.
    pub fn snapshot(&self) -> Vec<Task> {
        self.graph.node_weights().cloned().collect()
    }

    /// Rebuild a graph from a checkpoint snapshot.
    ///
    /// Recomputes edges from `depends_on` and the ready set from statuses,
    /// so a restored graph answers `ready()` identically to the one that
    /// was snapshotted.
    pub fn restore(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in &tasks {
            for dep in &task.depends_on {
                if !tasks.iter().any(|t| t.id == *dep) {
                    return Err(Error::StorageCorruption(format!(
                        "snapshot task {} depends on missing task {}",
                        task.id.short(),
                        dep.short()
                    )));
                }
            }
        }
        graph.check_acyclic(&tasks)?;

        for task in tasks {
            let id = task.id;
            let index = graph.graph.add_node(task);
            graph.task_index.insert(id, index);
        }
        let ids: Vec<TaskId> = graph.task_index.keys().copied().collect();
        for id in &ids {
            let index = graph.task_index[id];
            let deps: Vec<TaskId> = graph.graph[index].depends_on.iter().copied().collect();
            for dep in deps {
                let dep_index = graph.task_index[&dep];
                graph.graph.add_edge(dep_index, index, ());
            }
        }
        for id in ids {
            if graph.is_ready(&id) {
                graph.ready.insert(id);
            }
        }
        Ok(graph)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("ready", &self.ready.len())
            .finish()
    }
}
