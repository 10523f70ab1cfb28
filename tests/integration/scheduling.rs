//! Dispatch ordering: priority, FIFO tie-break, and dependency gating.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use conductor::core::task::Priority;
use conductor::orchestration::registry::AgentDescriptor;

use crate::fixtures::{open_orchestrator, project, task, task_with_priority, RecordingWorker};

#[tokio::test]
async fn test_priority_order_on_single_agent() {
    // Given one serial agent and three tasks of differing priority
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 1),
        Arc::new(RecordingWorker {
            order: Arc::clone(&order),
        }),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project(
            "priorities",
            vec![
                task_with_priority("low", "build", &[], Priority::Low),
                task_with_priority("critical", "build", &[], Priority::Critical),
                task_with_priority("high", "build", &[], Priority::High),
            ],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let invoked = order.lock().unwrap().clone();
    assert_eq!(
        invoked,
        vec!["critical work", "high work", "low work"]
    );
}

#[tokio::test]
async fn test_fifo_tie_break_within_priority() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 1),
        Arc::new(RecordingWorker {
            order: Arc::clone(&order),
        }),
    )
    .await
    .unwrap();

    // Separate submissions give distinct creation times
    let first = orch
        .submit_project(project("first", vec![task("first", "build", &[])]))
        .unwrap();
    let second = orch
        .submit_project(project("second", vec![task("second", "build", &[])]))
        .unwrap();

    orch.run_until_settled(&first).await.unwrap();
    orch.run_until_settled(&second).await.unwrap();

    let invoked = order.lock().unwrap().clone();
    assert_eq!(invoked, vec!["first work", "second work"]);
}

#[tokio::test]
async fn test_dependency_outranks_priority() {
    // A Critical task gated behind a Low dependency must still wait
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 1),
        Arc::new(RecordingWorker {
            order: Arc::clone(&order),
        }),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project(
            "gated",
            vec![
                task_with_priority("gate", "build", &[], Priority::Low),
                task_with_priority("urgent", "build", &["gate"], Priority::Critical),
            ],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let invoked = order.lock().unwrap().clone();
    assert_eq!(invoked, vec!["gate work", "urgent work"]);
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    // An agent with limit 2 never carries more than 2 invocations; the
    // recording worker counts concurrent entries via a high-water mark.
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use conductor::orchestration::registry::{CapabilityError, TaskPayload, Worker};
    use tokio_util::sync::CancellationToken;

    struct GaugeWorker {
        current: AtomicUsize,
        high_water: AtomicUsize,
    }

    #[async_trait]
    impl Worker for GaugeWorker {
        async fn invoke(
            &self,
            _payload: TaskPayload,
            _cancel: CancellationToken,
        ) -> Result<serde_json::Value, CapabilityError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }
    }

    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let gauge = Arc::new(GaugeWorker {
        current: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
    });
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 2),
        Arc::clone(&gauge) as Arc<dyn Worker>,
    )
    .await
    .unwrap();

    let tasks = (0..8).map(|i| task(&format!("t{}", i), "build", &[])).collect();
    let batch = orch.submit_project(project("bounded", tasks)).unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    assert_eq!(orch.status(&batch).unwrap().counts["completed"], 8);
    assert!(gauge.high_water.load(Ordering::SeqCst) <= 2);
}
