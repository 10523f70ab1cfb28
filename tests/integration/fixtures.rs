//! Test fixtures for integration tests.
//!
//! Provides mock workers, fast-running configs, and project spec
//! builders shared across the scenario modules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use conductor::core::task::Priority;
use conductor::orchestration::registry::{CapabilityError, TaskPayload, Worker};
use conductor::orchestrator::{Constraints, TaskSpec};
use conductor::{Config, Orchestrator, ProjectSpec};

/// Config tuned so retries and checkpoints happen within test time.
pub fn fast_config() -> Config {
    Config {
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
        checkpoint_interval: 3,
        ..Default::default()
    }
}

pub async fn open_orchestrator(dir: &TempDir) -> Orchestrator {
    Orchestrator::open(fast_config(), dir.path())
        .await
        .expect("orchestrator should open on an empty directory")
}

pub fn project(description: &str, tasks: Vec<TaskSpec>) -> ProjectSpec {
    ProjectSpec {
        description: description.to_string(),
        constraints: Constraints::default(),
        tasks,
    }
}

pub fn task(name: &str, capability: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        capability: capability.to_string(),
        description: format!("{} work", name),
        priority: Priority::default(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        max_attempts: None,
    }
}

pub fn task_with_priority(
    name: &str,
    capability: &str,
    deps: &[&str],
    priority: Priority,
) -> TaskSpec {
    TaskSpec {
        priority,
        ..task(name, capability, deps)
    }
}

/// Succeeds immediately, echoing the task description.
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn invoke(
        &self,
        payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        Ok(json!({ "echo": payload.description }))
    }
}

/// Succeeds but flags the result for gated approval.
pub struct ReviewWorker;

#[async_trait]
impl Worker for ReviewWorker {
    async fn invoke(
        &self,
        payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        Ok(json!({ "requires_review": true, "draft": payload.description }))
    }
}

/// Records the order in which task descriptions were invoked.
pub struct RecordingWorker {
    pub order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn invoke(
        &self,
        payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        self.order
            .lock()
            .expect("order log poisoned")
            .push(payload.description.clone());
        Ok(json!({}))
    }
}

/// Fails until the given invocation count, then succeeds.
pub struct FlakyWorker {
    pub succeed_on: u32,
    pub calls: AtomicU32,
}

impl FlakyWorker {
    pub fn new(succeed_on: u32) -> Self {
        Self {
            succeed_on,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn invoke(
        &self,
        _payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            Err(CapabilityError::Failed(format!("flake on call {}", call)))
        } else {
            Ok(json!({ "ok": call }))
        }
    }
}

/// Sleeps past any sane timeout on its first call, then answers
/// promptly.
pub struct FirstCallSleeper {
    calls: AtomicU32,
}

impl FirstCallSleeper {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Worker for FirstCallSleeper {
    async fn invoke(
        &self,
        _payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(json!({ "ok": call }))
    }
}

/// Never fails, never finishes, never listens.
pub struct StubbornSleeper;

#[async_trait]
impl Worker for StubbornSleeper {
    async fn invoke(
        &self,
        _payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({}))
    }
}

/// Always fails with the same message.
pub struct AlwaysFails;

#[async_trait]
impl Worker for AlwaysFails {
    async fn invoke(
        &self,
        _payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        Err(CapabilityError::Failed("permanent failure".to_string()))
    }
}

/// A randomly-shaped acyclic project: edges only point from earlier to
/// later tasks, so the batch is valid by construction. Seeded for
/// reproducibility.
pub fn random_dag_project(task_count: usize, seed: u64) -> ProjectSpec {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tasks = Vec::with_capacity(task_count);
    for i in 0..task_count {
        let mut deps = Vec::new();
        for j in 0..i {
            // Sparse edges keep the graph wide enough for parallelism
            if rng.gen_bool(0.2) {
                deps.push(format!("t{}", j));
            }
        }
        let dep_refs: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
        tasks.push(task(&format!("t{}", i), "build", &dep_refs));
    }
    project("random dag", tasks)
}
