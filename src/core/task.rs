//! Task data model for the orchestration core.
//!
//! Tasks are the atomic units of work claimed by agents. Each task tracks
//! its required capability, dependencies, priority, lifecycle status,
//! attempts, and result.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by all tasks submitted together as one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Scheduling priority of a task.
///
/// Ordered so that `Low < Medium < High < Critical`, which the scheduler's
/// priority queue relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Promote one tier up, saturating at Critical.
    ///
    /// Used by the scheduler's starvation avoidance.
    pub fn promote(self) -> Self {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High => Priority::Critical,
            Priority::Critical => Priority::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of failure recorded against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worker did not respond within its capability timeout.
    Timeout,
    /// Worker reported a failure from its capability entry point.
    WorkerFailure,
    /// Task was cancelled while in flight.
    Cancelled,
    /// Downstream validation flagged the result as conflicting.
    Conflict,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::WorkerFailure => write!(f, "worker_failure"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Conflict => write!(f, "conflict"),
        }
    }
}

/// Structured failure detail attached to a task in the Error state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// What category of failure occurred.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// Task status in its lifecycle.
///
/// The full transition table lives in [`crate::core::lifecycle`]; this enum
/// is only the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet claimed by the scheduler.
    #[default]
    Pending,
    /// Task claimed and being executed by an agent.
    InProgress,
    /// Worker reported a missing external precondition.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Worker finished but the result requires gated approval.
    Review,
    /// Task completed successfully. Terminal.
    Completed,
    /// Worker failed. Terminal once attempts are exhausted.
    Error,
    /// Task was cancelled explicitly or by cascade. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status admits no further transitions.
    ///
    /// `Error` terminality also depends on the task's remaining attempts,
    /// which this status-only check cannot see; see [`Task::is_terminal`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Review => write!(f, "review"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single unit of work in the orchestration core.
///
/// Tasks carry a capability name that the dispatcher resolves to a concrete
/// worker, a dependency set forming the edges of the task graph, and retry
/// accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Named kind of work a worker must perform (e.g. "generate-schema").
    pub capability: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Tasks that must be Completed before this one may start.
    pub depends_on: HashSet<TaskId>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Agent currently (or last) assigned to this task.
    pub assigned_agent: Option<AgentId>,
    /// Number of invocation attempts made so far.
    pub attempt: u32,
    /// Maximum attempts before Error becomes terminal.
    pub max_attempts: u32,
    /// Worker result payload, once available.
    pub result: Option<serde_json::Value>,
    /// Failure detail, if the task has errored.
    pub error: Option<ErrorInfo>,
    /// Batch this task was submitted with.
    pub batch_id: BatchId,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last changed status.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new Pending task in the given batch.
    pub fn new(capability: &str, description: &str, batch_id: BatchId) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            capability: capability.to_string(),
            description: description.to_string(),
            depends_on: HashSet::new(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            attempt: 0,
            max_attempts: 3,
            result: None,
            error: None,
            batch_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style max attempts override.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder-style dependency declaration.
    pub fn with_dependency(mut self, dep: TaskId) -> Self {
        self.depends_on.insert(dep);
        self
    }

    /// Whether the task can never change state again.
    ///
    /// Completed and Cancelled are always terminal; Error is terminal only
    /// once attempts are exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Error => self.attempt >= self.max_attempts,
            _ => false,
        }
    }

    /// Whether the task is still eligible for a retry after an error.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Error && self.attempt < self.max_attempts
    }

    /// Record the agent claiming this task.
    pub fn assign_agent(&mut self, agent_id: AgentId) {
        self.assigned_agent = Some(agent_id);
        self.updated_at = Utc::now();
    }

    /// Record the worker's result payload.
    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = Some(result);
        self.updated_at = Utc::now();
    }

    /// Record failure detail.
    pub fn set_error(&mut self, info: ErrorInfo) {
        self.error = Some(info);
        self.updated_at = Utc::now();
    }
}
