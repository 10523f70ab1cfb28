//! Agent registry: capability providers and their capacity accounting.
//!
//! The core owns no knowledge of how a worker does its job, only which
//! capability names it services and how many invocations it can carry at
//! once. Dynamically provisioned worker kinds are capability factories
//! resolved at dispatch time; they register through the same contract as
//! static agents, never through runtime code generation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clog_debug;
use crate::core::task::{AgentId, Task, TaskId};
use crate::error::{Error, Result};

/// Failure reported by a worker's capability entry point.
///
/// Deliberately separate from the orchestrator's own [`enum@Error`]:
/// workers are external collaborators and their failures are task-level
/// data, not control-flow errors inside the core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("capability failed: {0}")]
    Failed(String),

    #[error("capability not supported: {0}")]
    Unsupported(String),

    #[error("invocation cancelled")]
    Cancelled,
}

/// The task data handed to a worker. Workers see nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub capability: String,
    pub description: String,
    /// 1-based invocation attempt, so a worker can vary retry behavior.
    pub attempt: u32,
}

impl TaskPayload {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            capability: task.capability.clone(),
            description: task.description.clone(),
            attempt: task.attempt,
        }
    }
}

/// A pluggable capability provider.
///
/// Implementations must observe the cancellation token and abort promptly;
/// the dispatcher enforces a grace period regardless.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(
        &self,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> std::result::Result<serde_json::Value, CapabilityError>;
}

/// Factory producing workers for a capability on demand.
pub type WorkerFactory = Box<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Registered agent metadata and capacity counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique identifier for this agent.
    pub id: AgentId,
    /// Capability names this agent services.
    pub capabilities: HashSet<String>,
    /// Maximum concurrent invocations.
    pub concurrency_limit: usize,
    /// Invocations currently running. Always `<= concurrency_limit`.
    pub in_flight: usize,
}

impl AgentDescriptor {
    pub fn new(capabilities: impl IntoIterator<Item = String>, concurrency_limit: usize) -> Self {
        Self {
            id: AgentId::new(),
            capabilities: capabilities.into_iter().collect(),
            concurrency_limit,
            in_flight: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.concurrency_limit
    }
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    worker: Arc<dyn Worker>,
}

/// Maps capabilities to concrete workers and tracks their capacity.
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentEntry>,
    factories: HashMap<String, (usize, WorkerFactory)>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            factories: HashMap::new(),
        }
    }

    /// Register a concrete agent for its declared capabilities.
    pub fn register(&mut self, descriptor: AgentDescriptor, worker: Arc<dyn Worker>) -> Result<()> {
        if descriptor.capabilities.is_empty() {
            return Err(Error::Validation(
                "agent must declare at least one capability".to_string(),
            ));
        }
        if descriptor.concurrency_limit == 0 {
            return Err(Error::Validation(
                "agent concurrency limit must be at least 1".to_string(),
            ));
        }
        clog_debug!(
            "registry: agent {} capabilities={:?} limit={}",
            descriptor.id.short(),
            descriptor.capabilities,
            descriptor.concurrency_limit
        );
        self.agents.insert(
            descriptor.id,
            AgentEntry {
                descriptor,
                worker,
            },
        );
        Ok(())
    }

    /// Register a factory resolved at dispatch time for a capability with
    /// no live agent. The first dispatch needing it instantiates a worker
    /// and registers it through the normal [`AgentRegistry::register`]
    /// path.
    pub fn register_factory(
        &mut self,
        capability: &str,
        concurrency_limit: usize,
        factory: WorkerFactory,
    ) {
        self.factories
            .insert(capability.to_string(), (concurrency_limit, factory));
    }

    /// Pick an agent for a capability, materializing a factory if needed.
    ///
    /// # Errors
    /// - `AgentUnavailable` when nothing (agent or factory) services the
    ///   capability
    /// - `AgentBusy` when agents exist but all are at their limit
    pub fn agent_for(&mut self, capability: &str) -> Result<AgentId> {
        let mut busy: Option<(AgentId, usize)> = None;
        for entry in self.agents.values() {
            if !entry.descriptor.capabilities.contains(capability) {
                continue;
            }
            if entry.descriptor.has_capacity() {
                return Ok(entry.descriptor.id);
            }
            busy = Some((entry.descriptor.id, entry.descriptor.concurrency_limit));
        }
        if let Some((id, limit)) = busy {
            return Err(Error::AgentBusy { id, limit });
        }

        // No agent at all: try a factory.
        if let Some((limit, factory)) = self.factories.get(capability) {
            let worker = factory();
            let descriptor =
                AgentDescriptor::new([capability.to_string()], *limit);
            let id = descriptor.id;
            let limit = *limit;
            clog_debug!(
                "registry: materialized factory agent {} for capability {} (limit {})",
                id.short(),
                capability,
                limit
            );
            self.register(descriptor, worker)?;
            return Ok(id);
        }

        Err(Error::AgentUnavailable(capability.to_string()))
    }

    /// Reserve an invocation slot on an agent.
    pub fn claim(&mut self, id: &AgentId) -> Result<()> {
        let entry = self
            .agents
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("unknown agent {}", id)))?;
        if !entry.descriptor.has_capacity() {
            return Err(Error::AgentBusy {
                id: *id,
                limit: entry.descriptor.concurrency_limit,
            });
        }
        entry.descriptor.in_flight += 1;
        Ok(())
    }

    /// Release an invocation slot.
    pub fn release(&mut self, id: &AgentId) {
        if let Some(entry) = self.agents.get_mut(id) {
            entry.descriptor.in_flight = entry.descriptor.in_flight.saturating_sub(1);
        }
    }

    /// The worker behind an agent.
    pub fn worker(&self, id: &AgentId) -> Option<Arc<dyn Worker>> {
        self.agents.get(id).map(|e| Arc::clone(&e.worker))
    }

    pub fn descriptor(&self, id: &AgentId) -> Option<&AgentDescriptor> {
        self.agents.get(id).map(|e| &e.descriptor)
    }

    pub fn descriptors(&self) -> Vec<&AgentDescriptor> {
        self.agents.values().map(|e| &e.descriptor).collect()
    }

    /// Total spare capacity across agents servicing a capability.
    pub fn capacity_for(&self, capability: &str) -> usize {
        self.agents
            .values()
            .filter(|e| e.descriptor.capabilities.contains(capability))
            .map(|e| {
                e.descriptor
                    .concurrency_limit
                    .saturating_sub(e.descriptor.in_flight)
            })
            .sum()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
