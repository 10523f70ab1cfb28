//! Core domain models for the orchestration system.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration core: tasks, the lifecycle state machine, and the
//! dependency graph.

pub mod graph;
pub mod lifecycle;
pub mod task;

pub use graph::TaskGraph;
pub use lifecycle::TransitionRecord;
pub use task::{AgentId, BatchId, ErrorInfo, ErrorKind, Priority, Task, TaskId, TaskStatus};
