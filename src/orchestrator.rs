//! The orchestrator façade: submit, observe, approve, cancel.
//!
//! Composes the task graph, scheduler, dispatcher, resolver, bus, and
//! stores into the external API. This is the only module that knows what
//! a "project" is; everything beneath it speaks `Task` and `TaskId`.
//!
//! The run loop is the single logical tick owner. Each dispatch runs as
//! an independent tokio task supervised by the [`Dispatcher`]; outcomes
//! come back to the loop, which applies transitions through the
//! write-ahead path: graph -> context store -> bus publish -> ack.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{topics, MessageBus, Subscription};
use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::lifecycle::TransitionRecord;
use crate::core::task::{
    AgentId, BatchId, ErrorInfo, ErrorKind, Priority, Task, TaskId, TaskStatus,
};
use crate::error::{Error, Result};
use crate::orchestration::dispatcher::{Dispatcher, InvocationOutcome};
use crate::orchestration::registry::{AgentDescriptor, AgentRegistry, TaskPayload, Worker, WorkerFactory};
use crate::orchestration::resolver::{self, Arbitration, Resolution};
use crate::orchestration::scheduler::Scheduler;
use crate::store::checkpoint::CheckpointStore;
use crate::store::context::{ContextStore, DecisionRecord};
use crate::{clog, clog_warn};

/// Declarative description of a project: what to build, as a task batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// Human description of the overall project.
    pub description: String,
    #[serde(default)]
    pub constraints: Constraints,
    /// The tasks making up the project.
    pub tasks: Vec<TaskSpec>,
}

/// Optional project-level constraints. Advisory; recorded, not enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    pub budget: Option<u64>,
    pub deadline: Option<DateTime<Utc>>,
}

/// One task in a [`ProjectSpec`]. Dependencies refer to sibling task
/// names, resolved to ids at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name unique within the project, used for dependency references.
    pub name: String,
    pub capability: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the configured default when set.
    pub max_attempts: Option<u32>,
}

/// Aggregate view of one submitted batch.
#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    pub batch_id: BatchId,
    pub description: Option<String>,
    /// Task counts keyed by status label.
    pub counts: BTreeMap<String, usize>,
    pub tasks: Vec<Task>,
    /// Decision log entries concerning this batch's tasks.
    pub decisions: Vec<DecisionRecord>,
    /// Whether every task is terminal.
    pub settled: bool,
}

/// One observable lifecycle event, numbered by WAL sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// A restartable event stream: the replayed backlog plus a live tail.
///
/// Replay and subscription may overlap at the boundary; consumers are
/// expected to deduplicate, the same at-least-once contract as the bus.
pub struct EventStream {
    pub replay: Vec<TaskEvent>,
    pub live: Subscription,
}

struct ProjectMeta {
    description: String,
    #[allow(dead_code)]
    constraints: Constraints,
}

/// The external-facing orchestration core.
pub struct Orchestrator {
    config: Config,
    graph: TaskGraph,
    store: ContextStore,
    checkpoints: CheckpointStore,
    bus: Arc<MessageBus>,
    registry: Arc<RwLock<AgentRegistry>>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    projects: HashMap<BatchId, ProjectMeta>,
    /// Cancellation tokens for in-flight invocations.
    active: HashMap<TaskId, CancellationToken>,
    /// Tasks already InProgress that need (re-)dispatch: rejected reviews
    /// and resolved blocks.
    pending_dispatch: Vec<TaskId>,
    events: Vec<TaskEvent>,
    observed_version: u64,
    transitions_since_checkpoint: u64,
}

impl Orchestrator {
    /// Open an orchestrator over the given data directory, recovering
    /// from the highest checkpoint and replaying the write-ahead log
    /// tail on top of it.
    pub async fn open(config: Config, data_dir: &Path) -> Result<Self> {
        let mut store = ContextStore::open(data_dir)?;
        let checkpoints = CheckpointStore::open(&data_dir.join("checkpoints"))?;

        let mut recovered_seq = 0;
        let graph = match checkpoints.latest()? {
            Some(checkpoint) => {
                clog!(
                    "recovery: loading checkpoint {} ({} tasks, wal_seq {})",
                    checkpoint.sequence,
                    checkpoint.tasks.len(),
                    checkpoint.wal_seq
                );
                recovered_seq = checkpoint.wal_seq;
                store.load_snapshot(checkpoint.tasks.clone(), checkpoint.decision_log.clone());
                TaskGraph::restore(checkpoint.tasks)?
            }
            None => TaskGraph::new(),
        };

        let bus = Arc::new(MessageBus::new(config.bus_queue_depth));
        let registry = Arc::new(RwLock::new(AgentRegistry::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.capability_timeout(),
            config.cancel_grace(),
        ));
        let scheduler = Scheduler::new(config.starvation_age());

        let observed_version = store.version();
        let mut orchestrator = Self {
            config,
            graph,
            store,
            checkpoints,
            bus,
            registry,
            dispatcher,
            scheduler,
            projects: HashMap::new(),
            active: HashMap::new(),
            pending_dispatch: Vec::new(),
            events: Vec::new(),
            observed_version,
            transitions_since_checkpoint: 0,
        };
        orchestrator.replay_wal(recovered_seq).await?;
        Ok(orchestrator)
    }

    /// Rebuild the observable event history from the full write-ahead
    /// log, reapplying the transitions the latest checkpoint does not
    /// cover and republishing the ones whose ack never landed. Keeping
    /// every entry, not just the uncovered tail, is what makes
    /// `stream_events` resumable from any sequence after a restart.
    async fn replay_wal(&mut self, covered: u64) -> Result<()> {
        let history: Vec<_> = self.store.entries_after(0).to_vec();
        for entry in history {
            let record = &entry.record;
            if entry.seq > covered {
                // The checkpoint predates the transition; reapply if
                // the graph still shows the old status.
                if let Some(task) = self.graph.get_task(&record.task_id) {
                    if task.status == record.from {
                        self.graph
                            .apply_transition(&record.task_id, record.to.clone())?;
                    }
                }
            }
            self.push_event(entry.seq, record);
            if !record.published {
                clog!(
                    "recovery: republishing transition {} {} -> {}",
                    record.task_id.short(),
                    record.from,
                    record.to
                );
                self.publish_transition(entry.seq, record).await;
                self.store.mark_published(entry.seq)?;
            }
        }

        // Invocations lost with the previous process: the tasks are
        // InProgress with no worker behind them, so queue a re-dispatch.
        let stranded: Vec<TaskId> = self
            .graph
            .all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();
        for id in stranded {
            clog!("recovery: requeueing in-flight task {}", id.short());
            self.pending_dispatch.push(id);
        }
        Ok(())
    }

    /// Register a concrete agent.
    pub async fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        worker: Arc<dyn Worker>,
    ) -> Result<()> {
        self.registry.write().await.register(descriptor, worker)
    }

    /// Register a worker factory for a capability, materialized on first
    /// dispatch.
    pub async fn register_capability_factory(
        &self,
        capability: &str,
        concurrency_limit: usize,
        factory: WorkerFactory,
    ) {
        self.registry
            .write()
            .await
            .register_factory(capability, concurrency_limit, factory);
    }

    /// Override the invocation timeout for one capability.
    pub fn set_capability_timeout(&self, capability: &str, timeout: std::time::Duration) {
        self.dispatcher.set_capability_timeout(capability, timeout);
    }

    /// Submit a project as a dependency-edged task batch.
    ///
    /// The whole batch is validated before anything is persisted: a cycle
    /// or a dangling dependency rejects the submission with the stores
    /// untouched.
    pub fn submit_project(&mut self, spec: ProjectSpec) -> Result<BatchId> {
        if spec.tasks.is_empty() {
            return Err(Error::Validation("project has no tasks".to_string()));
        }

        let mut tasks = Vec::with_capacity(spec.tasks.len());
        let mut by_name: HashMap<&str, TaskId> = HashMap::new();
        for task_spec in &spec.tasks {
            let task = Task::new(
                &task_spec.capability,
                &task_spec.description,
                BatchId::new(),
            )
            .with_priority(task_spec.priority)
            .with_max_attempts(
                task_spec
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts),
            );
            if by_name.insert(&task_spec.name, task.id).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate task name in project: {}",
                    task_spec.name
                )));
            }
            tasks.push(task);
        }

        let mut edges = Vec::new();
        for (task, task_spec) in tasks.iter().zip(&spec.tasks) {
            for dep_name in &task_spec.depends_on {
                let Some(&dep_id) = by_name.get(dep_name.as_str()) else {
                    return Err(Error::Validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task_spec.name, dep_name
                    )));
                };
                edges.push((dep_id, task.id));
            }
        }

        let count = tasks.len();
        let batch_id = self.graph.submit_batch(tasks, edges)?;
        let persisted: Vec<Task> = self
            .graph
            .tasks_in_batch(&batch_id)
            .into_iter()
            .cloned()
            .collect();
        self.write_with_retry(|store, version| store.put_tasks(version, &persisted))?;
        self.checkpoint_now();

        self.projects.insert(
            batch_id,
            ProjectMeta {
                description: spec.description.clone(),
                constraints: spec.constraints,
            },
        );
        clog!(
            "submitted project '{}' as batch {} ({} tasks)",
            spec.description,
            batch_id.short(),
            count
        );
        Ok(batch_id)
    }

    /// Aggregate status for a batch.
    pub fn status(&self, batch_id: &BatchId) -> Result<ProjectStatus> {
        let tasks: Vec<Task> = self
            .graph
            .tasks_in_batch(batch_id)
            .into_iter()
            .cloned()
            .collect();
        if tasks.is_empty() {
            return Err(Error::BatchNotFound(batch_id.to_string()));
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for task in &tasks {
            *counts.entry(status_key(&task.status).to_string()).or_insert(0) += 1;
        }
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let decisions = self
            .store
            .decisions()
            .iter()
            .filter(|d| task_ids.contains(&d.task_id))
            .cloned()
            .collect();

        Ok(ProjectStatus {
            batch_id: *batch_id,
            description: self.projects.get(batch_id).map(|p| p.description.clone()),
            counts,
            settled: self.graph.batch_settled(batch_id),
            tasks,
            decisions,
        })
    }

    /// Cancel every non-terminal task in a batch, cascading through
    /// dependents.
    pub async fn cancel(&mut self, batch_id: &BatchId) -> Result<()> {
        let ids: Vec<TaskId> = self
            .graph
            .tasks_in_batch(batch_id)
            .iter()
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            return Err(Error::BatchNotFound(batch_id.to_string()));
        }
        for id in ids {
            if self.graph.get_task(&id).map_or(true, Task::is_terminal) {
                continue;
            }
            self.cancel_task(&id).await?;
        }
        Ok(())
    }

    /// Cancel one task and all of its transitive dependents.
    pub async fn cancel_task(&mut self, task_id: &TaskId) -> Result<()> {
        let records = self.graph.cascade_cancel(task_id)?;
        for record in records {
            if let Some(token) = self.active.remove(&record.task_id) {
                token.cancel();
            }
            self.persist_record(&record).await?;
        }
        Ok(())
    }

    /// Approve a task awaiting review.
    pub async fn approve(&mut self, task_id: &TaskId) -> Result<()> {
        self.require_review(task_id)?;
        self.commit_transition(task_id, TaskStatus::Completed).await?;
        let agent = self.graph.get_task(task_id).and_then(|t| t.assigned_agent);
        self.record_decision(DecisionRecord::new(*task_id, agent, "review approved"))
            .await?;
        Ok(())
    }

    /// Reject a reviewed result; the task is re-run.
    pub async fn reject(&mut self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.require_review(task_id)?;
        self.commit_transition(task_id, TaskStatus::InProgress).await?;
        let agent = self.graph.get_task(task_id).and_then(|t| t.assigned_agent);
        self.record_decision(DecisionRecord::new(
            *task_id,
            agent,
            &format!("review rejected: {}", reason),
        ))
        .await?;
        self.pending_dispatch.push(*task_id);
        Ok(())
    }

    /// Clear a Blocked task whose external precondition is now met.
    pub async fn unblock(&mut self, task_id: &TaskId) -> Result<()> {
        let status = self
            .graph
            .get_task(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?
            .status
            .clone();
        if !matches!(status, TaskStatus::Blocked { .. }) {
            return Err(Error::Validation(format!(
                "task {} is not blocked (status: {})",
                task_id.short(),
                status
            )));
        }
        self.commit_transition(task_id, TaskStatus::InProgress).await?;
        self.graph.release_holds(task_id);
        self.pending_dispatch.push(*task_id);
        Ok(())
    }

    /// Arbitrate a flagged conflict between two tasks' results.
    ///
    /// Priority wins: the loser's result is discarded (an Error with
    /// `ErrorKind::Conflict` if the task is still live). A tie escalates
    /// every live participant to Review and surfaces
    /// `ConflictUnresolved`. Either way the decision log records both
    /// sides and a `conflict.decision` message is published.
    pub async fn resolve_conflict(
        &mut self,
        a: &TaskId,
        b: &TaskId,
        conflict: &str,
    ) -> Result<Resolution> {
        let task_a = self
            .graph
            .get_task(a)
            .ok_or(Error::TaskNotFound(*a))?
            .clone();
        let task_b = self
            .graph
            .get_task(b)
            .ok_or(Error::TaskNotFound(*b))?
            .clone();

        let (arbitration, decisions) = resolver::arbitrate(&task_a, &task_b, conflict);
        for decision in decisions {
            self.record_decision(decision).await?;
        }

        match arbitration {
            Arbitration::Decided(resolution) => {
                self.bus
                    .publish_payload(
                        topics::CONFLICT_DECISION,
                        Some(resolution.winner),
                        json!({
                            "winner": resolution.winner,
                            "loser": resolution.loser,
                            "rationale": resolution.rationale,
                        }),
                    )
                    .await;
                let loser_live = self
                    .graph
                    .get_task(&resolution.loser)
                    .map_or(false, |t| t.status == TaskStatus::InProgress);
                if loser_live {
                    if let Some(task) = self.graph.get_task_mut(&resolution.loser) {
                        task.set_error(ErrorInfo::new(ErrorKind::Conflict, &resolution.rationale));
                        task.attempt = task.max_attempts;
                    }
                    self.commit_transition(&resolution.loser, TaskStatus::Error)
                        .await?;
                }
                Ok(resolution)
            }
            Arbitration::Escalated { rationale } => {
                self.bus
                    .publish_payload(
                        topics::CONFLICT_DECISION,
                        Some(*a),
                        json!({
                            "escalated": [a, b],
                            "rationale": rationale,
                        }),
                    )
                    .await;
                for id in [a, b] {
                    let live = self
                        .graph
                        .get_task(id)
                        .map_or(false, |t| t.status == TaskStatus::InProgress);
                    if live {
                        self.commit_transition(id, TaskStatus::Review).await?;
                    }
                }
                Err(Error::ConflictUnresolved { a: *a, b: *b })
            }
        }
    }

    /// Restartable event stream for a batch: everything from `from_seq`
    /// onward, then live transitions. Observation only; duplicates at the
    /// replay/live boundary are possible and must be deduplicated by the
    /// consumer.
    pub fn stream_events(&self, batch_id: &BatchId, from_seq: u64) -> Result<EventStream> {
        if self.graph.tasks_in_batch(batch_id).is_empty() {
            return Err(Error::BatchNotFound(batch_id.to_string()));
        }
        let live = self.bus.subscribe(topics::TASK_TRANSITION);
        let replay = self
            .events
            .iter()
            .filter(|e| e.batch_id == *batch_id && e.seq >= from_seq)
            .cloned()
            .collect();
        Ok(EventStream { replay, live })
    }

    /// Drive a batch until every task is terminal or nothing can make
    /// progress (all remaining work blocked or unservable).
    pub async fn run_until_settled(&mut self, batch_id: &BatchId) -> Result<()> {
        if self.graph.tasks_in_batch(batch_id).is_empty() {
            return Err(Error::BatchNotFound(batch_id.to_string()));
        }

        let mut in_flight: FuturesUnordered<JoinHandle<(TaskId, AgentId, InvocationOutcome)>> =
            FuturesUnordered::new();
        let mut retries: Vec<(tokio::time::Instant, TaskId)> = Vec::new();

        loop {
            let mut progressed = false;

            // Requeue retries whose backoff has elapsed.
            let now = tokio::time::Instant::now();
            let mut due = Vec::new();
            retries.retain(|(at, id)| {
                if *at <= now {
                    due.push(*id);
                    false
                } else {
                    true
                }
            });
            for id in due {
                if self.graph.get_task(&id).map_or(false, Task::can_retry) {
                    self.commit_transition(&id, TaskStatus::InProgress).await?;
                    self.pending_dispatch.push(id);
                }
            }

            // Re-dispatch tasks already InProgress (rejected reviews,
            // resolved blocks, retries).
            let rework: Vec<TaskId> = self.pending_dispatch.drain(..).collect();
            for id in rework {
                match self.launch(&id).await {
                    Ok(handle) => {
                        in_flight.push(handle);
                        progressed = true;
                    }
                    Err(e) if e.is_transient() => self.pending_dispatch.push(id),
                    Err(Error::AgentUnavailable(capability)) => {
                        clog_warn!(
                            "no agent for capability '{}'; task {} waits",
                            capability,
                            id.short()
                        );
                        self.pending_dispatch.push(id);
                    }
                    Err(e) => return Err(e),
                }
            }

            // Schedule fresh ready tasks up to the concurrency budget.
            let capacity = self
                .config
                .default_concurrency_limit
                .saturating_sub(in_flight.len());
            for dispatch in self.scheduler.tick(&self.graph, capacity) {
                match self.launch(&dispatch.task_id).await {
                    Ok(handle) => {
                        in_flight.push(handle);
                        progressed = true;
                    }
                    // Stays ready; the next tick offers it again.
                    Err(e) if e.is_transient() => {}
                    Err(Error::AgentUnavailable(capability)) => {
                        clog_warn!(
                            "no agent for capability '{}'; task {} stays pending",
                            capability,
                            dispatch.task_id.short()
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.graph.batch_settled(batch_id) && in_flight.is_empty() {
                break;
            }

            if let Some(joined) = in_flight.next().await {
                let (task_id, agent_id, outcome) =
                    joined.map_err(|e| Error::Validation(format!("invocation panicked: {}", e)))?;
                self.handle_outcome(&task_id, agent_id, outcome, &mut retries)
                    .await?;
                continue;
            }

            // Nothing in flight: wait for the next retry, or give up if
            // no progress is possible.
            if let Some(&(at, _)) = retries.iter().min_by_key(|(at, _)| *at) {
                tokio::time::sleep_until(at).await;
                continue;
            }
            if !progressed {
                clog_warn!(
                    "batch {} stalled: tasks remain but none can progress",
                    batch_id.short()
                );
                break;
            }
        }
        Ok(())
    }

    /// Claim an agent and spawn the supervised invocation.
    async fn launch(
        &mut self,
        task_id: &TaskId,
    ) -> Result<JoinHandle<(TaskId, AgentId, InvocationOutcome)>> {
        let task = self
            .graph
            .get_task(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?
            .clone();
        let agent_id = self.dispatcher.claim(&task).await?;

        // From here the slot is held; give it back if the dispatch
        // cannot be committed.
        if task.status == TaskStatus::Pending {
            if let Err(e) = self.commit_transition(task_id, TaskStatus::InProgress).await {
                self.registry.write().await.release(&agent_id);
                return Err(e);
            }
        }
        let payload = match self.graph.get_task_mut(task_id) {
            Some(task) => {
                task.attempt += 1;
                task.assign_agent(agent_id);
                TaskPayload::from_task(task)
            }
            None => {
                self.registry.write().await.release(&agent_id);
                return Err(Error::TaskNotFound(*task_id));
            }
        };

        let token = CancellationToken::new();
        self.active.insert(*task_id, token.clone());

        let dispatcher = Arc::clone(&self.dispatcher);
        let id = *task_id;
        Ok(tokio::spawn(async move {
            let outcome = dispatcher.invoke(agent_id, payload, token).await;
            (id, agent_id, outcome)
        }))
    }

    async fn handle_outcome(
        &mut self,
        task_id: &TaskId,
        agent_id: AgentId,
        outcome: InvocationOutcome,
        retries: &mut Vec<(tokio::time::Instant, TaskId)>,
    ) -> Result<()> {
        self.active.remove(task_id);
        let Some(task) = self.graph.get_task(task_id) else {
            return Ok(());
        };
        // A task cancelled while in flight is already terminal; the late
        // outcome is a duplicate and must not change state.
        if task.is_terminal() {
            return Ok(());
        }

        match outcome {
            InvocationOutcome::Success { result } => {
                let needs_review = result
                    .get("requires_review")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if let Some(task) = self.graph.get_task_mut(task_id) {
                    task.set_result(result);
                }
                let to = if needs_review {
                    TaskStatus::Review
                } else {
                    TaskStatus::Completed
                };
                self.commit_transition(task_id, to).await?;
            }
            InvocationOutcome::Blocked { reason } => {
                self.commit_transition(task_id, TaskStatus::Blocked { reason })
                    .await?;
                self.graph.mark_dependents_blocked(task_id)?;
            }
            InvocationOutcome::Failure { message } => {
                self.fail_task(task_id, agent_id, ErrorKind::WorkerFailure, &message, retries)
                    .await?;
            }
            InvocationOutcome::TimedOut { after } => {
                let message = Error::CapabilityTimeout {
                    task_id: *task_id,
                    timeout: after,
                }
                .to_string();
                self.fail_task(task_id, agent_id, ErrorKind::Timeout, &message, retries)
                    .await?;
            }
            InvocationOutcome::Cancelled => {
                self.commit_transition(task_id, TaskStatus::Cancelled).await?;
            }
        }
        Ok(())
    }

    async fn fail_task(
        &mut self,
        task_id: &TaskId,
        agent_id: AgentId,
        kind: ErrorKind,
        message: &str,
        retries: &mut Vec<(tokio::time::Instant, TaskId)>,
    ) -> Result<()> {
        if let Some(task) = self.graph.get_task_mut(task_id) {
            task.set_error(ErrorInfo::new(kind, message));
        }
        self.commit_transition(task_id, TaskStatus::Error).await?;

        let task = self
            .graph
            .get_task(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        if task.can_retry() {
            let delay = self.config.backoff_delay(task.attempt);
            clog!(
                "task {} attempt {}/{} failed ({}); retrying in {:?}",
                task_id.short(),
                task.attempt,
                task.max_attempts,
                kind,
                delay
            );
            retries.push((tokio::time::Instant::now() + delay, *task_id));
        } else {
            clog_warn!(
                "task {} exhausted its {} attempts; cancelling dependents",
                task_id.short(),
                task.max_attempts
            );
            self.record_decision(DecisionRecord::new(
                *task_id,
                Some(agent_id),
                &format!("attempts exhausted: {}", message),
            ))
            .await?;
            let dependents = self.graph.dependents(task_id);
            for dependent in dependents {
                if !self.graph.get_task(&dependent).map_or(true, Task::is_terminal) {
                    self.cancel_task(&dependent).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply a transition through the full write-ahead path.
    async fn commit_transition(&mut self, task_id: &TaskId, to: TaskStatus) -> Result<()> {
        let record = self.graph.apply_transition(task_id, to)?;
        self.persist_record(&record).await
    }

    /// Persist an already-applied transition: WAL entry, event, publish,
    /// ack, checkpoint cadence.
    async fn persist_record(&mut self, record: &TransitionRecord) -> Result<()> {
        let task = self
            .graph
            .get_task(&record.task_id)
            .ok_or(Error::TaskNotFound(record.task_id))?
            .clone();
        let seq = self
            .write_with_retry(|store, version| store.record_transition(version, record, &task))?;
        self.push_event(seq, record);
        self.publish_transition(seq, record).await;
        self.store.mark_published(seq)?;

        self.transitions_since_checkpoint += 1;
        if self.transitions_since_checkpoint >= self.config.checkpoint_interval {
            self.checkpoint_now();
        }
        Ok(())
    }

    /// Run a versioned store write, refreshing the observed version and
    /// retrying on optimistic-concurrency failure.
    fn write_with_retry<T>(
        &mut self,
        mut write: impl FnMut(&mut ContextStore, u64) -> Result<T>,
    ) -> Result<T> {
        let mut attempts = 0u32;
        loop {
            match write(&mut self.store, self.observed_version) {
                Ok(value) => {
                    self.observed_version = self.store.version();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempts < 3 => {
                    attempts += 1;
                    self.observed_version = self.store.version();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn push_event(&mut self, seq: u64, record: &TransitionRecord) {
        let batch_id = self
            .graph
            .get_task(&record.task_id)
            .map(|t| t.batch_id)
            .unwrap_or_default();
        self.events.push(TaskEvent {
            seq,
            task_id: record.task_id,
            batch_id,
            from: record.from.clone(),
            to: record.to.clone(),
            at: record.at,
        });
    }

    async fn publish_transition(&self, seq: u64, record: &TransitionRecord) {
        let event = self.events.iter().rfind(|e| e.seq == seq);
        let payload = match event {
            Some(event) => serde_json::to_value(event).unwrap_or_else(|_| json!({})),
            None => json!({
                "seq": seq,
                "task_id": record.task_id,
                "from": record.from,
                "to": record.to,
            }),
        };
        self.bus
            .publish_payload(topics::TASK_TRANSITION, Some(record.task_id), payload)
            .await;
    }

    async fn record_decision(&mut self, decision: DecisionRecord) -> Result<()> {
        self.store.record_decision(decision)?;
        Ok(())
    }

    /// Best-effort checkpoint: a torn cut (tasks in flight) is skipped
    /// and retried at the next interval.
    fn checkpoint_now(&mut self) {
        match self.checkpoints.write(
            self.graph.snapshot(),
            self.store.decisions().to_vec(),
            self.store.wal_seq(),
        ) {
            Ok(checkpoint) => {
                self.transitions_since_checkpoint = 0;
                clog!("checkpoint {} taken", checkpoint.sequence);
            }
            Err(Error::Validation(_)) => {
                clog_warn!("checkpoint skipped: inconsistent cut");
            }
            Err(e) => {
                clog_warn!("checkpoint failed: {}", e);
            }
        }
    }

    fn require_review(&self, task_id: &TaskId) -> Result<()> {
        let task = self
            .graph
            .get_task(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        if task.status != TaskStatus::Review {
            return Err(Error::NotInReview {
                task_id: *task_id,
                status: task.status.clone(),
            });
        }
        Ok(())
    }

    /// Subscribe directly to a bus topic, for passive observers.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// Read access for tests and the CLI.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.graph.get_task(id)
    }

    pub fn decisions(&self) -> &[DecisionRecord] {
        self.store.decisions()
    }
}

fn status_key(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Blocked { .. } => "blocked",
        TaskStatus::Review => "review",
        TaskStatus::Completed => "completed",
        TaskStatus::Error => "error",
        TaskStatus::Cancelled => "cancelled",
    }
}
