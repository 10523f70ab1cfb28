//! Dispatcher: hands tasks to workers and supervises the invocation.
//!
//! Each invocation runs under the capability's timeout. Cancellation is
//! cooperative: the worker's token is cancelled first, and only after the
//! grace period expires is the invocation abandoned. Every outcome is
//! published on `task.result` so downstream consumers never have to poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{topics, MessageBus};
use crate::clog;
use crate::core::task::{AgentId, ErrorKind, Task};
use crate::error::Result;
use crate::orchestration::registry::{AgentRegistry, CapabilityError, TaskPayload};

/// How a supervised invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Worker returned a result payload.
    Success { result: serde_json::Value },
    /// Worker reported a failure.
    Failure { message: String },
    /// Worker reported a missing external precondition.
    Blocked { reason: String },
    /// Worker exceeded the capability timeout.
    TimedOut { after: Duration },
    /// Invocation was cancelled, cooperatively or after the grace period.
    Cancelled,
}

impl InvocationOutcome {
    /// The error kind to record against the task, if this outcome is a
    /// failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            InvocationOutcome::Success { .. } | InvocationOutcome::Blocked { .. } => None,
            InvocationOutcome::Failure { .. } => Some(ErrorKind::WorkerFailure),
            InvocationOutcome::TimedOut { .. } => Some(ErrorKind::Timeout),
            InvocationOutcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            InvocationOutcome::Success { .. } => "success",
            InvocationOutcome::Failure { .. } => "failure",
            InvocationOutcome::Blocked { .. } => "blocked",
            InvocationOutcome::TimedOut { .. } => "timeout",
            InvocationOutcome::Cancelled => "cancelled",
        }
    }
}

/// Supervises worker invocations for the orchestrator.
pub struct Dispatcher {
    registry: Arc<RwLock<AgentRegistry>>,
    bus: Arc<MessageBus>,
    default_timeout: Duration,
    capability_timeouts: std::sync::RwLock<HashMap<String, Duration>>,
    cancel_grace: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<AgentRegistry>>,
        bus: Arc<MessageBus>,
        default_timeout: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            default_timeout,
            capability_timeouts: std::sync::RwLock::new(HashMap::new()),
            cancel_grace,
        }
    }

    /// Override the invocation timeout for one capability.
    pub fn set_capability_timeout(&self, capability: &str, timeout: Duration) {
        self.capability_timeouts
            .write()
            .expect("timeout table poisoned")
            .insert(capability.to_string(), timeout);
    }

    pub fn timeout_for(&self, capability: &str) -> Duration {
        self.capability_timeouts
            .read()
            .expect("timeout table poisoned")
            .get(capability)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Claim an agent slot for a task.
    ///
    /// # Errors
    /// Propagates `AgentUnavailable` / `AgentBusy` from the registry; the
    /// caller decides whether to leave the task ready and retry later.
    pub async fn claim(&self, task: &Task) -> Result<AgentId> {
        let mut registry = self.registry.write().await;
        let agent_id = registry.agent_for(&task.capability)?;
        registry.claim(&agent_id)?;
        Ok(agent_id)
    }

    /// Run one invocation to completion under timeout and cancellation
    /// supervision, publish the outcome on `task.result`, and release the
    /// agent slot.
    pub async fn invoke(
        &self,
        agent_id: AgentId,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> InvocationOutcome {
        let worker = {
            let registry = self.registry.read().await;
            registry.worker(&agent_id)
        };
        let Some(worker) = worker else {
            return InvocationOutcome::Failure {
                message: format!("agent {} disappeared before invocation", agent_id.short()),
            };
        };

        let timeout = self.timeout_for(&payload.capability);
        let task_id = payload.task_id;
        let attempt = payload.attempt;
        let worker_token = cancel.child_token();
        let fut = worker.invoke(payload, worker_token);
        tokio::pin!(fut);

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, &mut fut) => match result {
                Ok(Ok(value)) => InvocationOutcome::Success { result: value },
                Ok(Err(CapabilityError::Cancelled)) => InvocationOutcome::Cancelled,
                Ok(Err(CapabilityError::Unsupported(what))) => InvocationOutcome::Blocked {
                    reason: format!("capability not supported: {}", what),
                },
                Ok(Err(CapabilityError::Failed(message))) => {
                    InvocationOutcome::Failure { message }
                }
                Err(_) => InvocationOutcome::TimedOut { after: timeout },
            },
            _ = cancel.cancelled() => {
                // The worker's token is already cancelled (child of ours);
                // give it the grace period to wind down, then abandon it.
                let _ = tokio::time::timeout(self.cancel_grace, &mut fut).await;
                InvocationOutcome::Cancelled
            }
        };

        clog!(
            "dispatch: task {} attempt {} on agent {} -> {}",
            task_id.short(),
            attempt,
            agent_id.short(),
            outcome.label()
        );

        {
            let mut registry = self.registry.write().await;
            registry.release(&agent_id);
        }

        let detail = match &outcome {
            InvocationOutcome::Success { result } => json!({ "result": result }),
            InvocationOutcome::Failure { message } => json!({ "error": message }),
            InvocationOutcome::Blocked { reason } => json!({ "reason": reason }),
            InvocationOutcome::TimedOut { after } => {
                json!({ "timeout_secs": after.as_secs() })
            }
            InvocationOutcome::Cancelled => json!({}),
        };
        let mut payload = json!({
            "task_id": task_id,
            "agent_id": agent_id,
            "attempt": attempt,
            "outcome": outcome.label(),
        });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), detail.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.bus
            .publish_payload(topics::TASK_RESULT, Some(task_id), payload)
            .await;

        outcome
    }
}
