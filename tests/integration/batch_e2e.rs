//! End-to-end batch execution: submit, run, observe, approve.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::core::task::{Priority, TaskStatus};
use conductor::orchestration::registry::AgentDescriptor;
use conductor::Error;

use crate::fixtures::{
    open_orchestrator, project, task, task_with_priority, EchoWorker, ReviewWorker,
};

#[tokio::test]
async fn test_two_task_chain_completes_in_order() {
    // Given a batch where B depends on A
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 4),
        Arc::new(EchoWorker),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project(
            "a then b",
            vec![task("a", "build", &[]), task("b", "build", &["a"])],
        ))
        .unwrap();

    // When the batch is driven to completion
    orch.run_until_settled(&batch).await.unwrap();

    // Then both tasks complete, and B never started before A finished
    let status = orch.status(&batch).unwrap();
    assert!(status.settled);
    assert_eq!(status.counts["completed"], 2);

    let a = status.tasks.iter().find(|t| t.description == "a work").unwrap();
    let b = status.tasks.iter().find(|t| t.description == "b work").unwrap();

    let events = orch.stream_events(&batch, 0).unwrap().replay;
    let a_completed = events
        .iter()
        .position(|e| e.task_id == a.id && e.to == TaskStatus::Completed)
        .unwrap();
    let b_started = events
        .iter()
        .position(|e| e.task_id == b.id && e.to == TaskStatus::InProgress)
        .unwrap();
    assert!(a_completed < b_started);
}

#[tokio::test]
async fn test_wide_batch_completes() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 4),
        Arc::new(EchoWorker),
    )
    .await
    .unwrap();

    let tasks = (0..10).map(|i| task(&format!("t{}", i), "build", &[])).collect();
    let batch = orch.submit_project(project("fan-out", tasks)).unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert_eq!(status.counts["completed"], 10);
}

#[tokio::test]
async fn test_cycle_rejects_whole_batch() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;

    let result = orch.submit_project(project(
        "cyclic",
        vec![
            task("a", "build", &["c"]),
            task("b", "build", &["a"]),
            task("c", "build", &["b"]),
        ],
    ));

    assert!(matches!(result, Err(Error::CycleDetected(_))));
    assert_eq!(result.unwrap_err().exit_code(), 1);
    // Nothing was persisted: a later valid submission starts clean
    let batch = orch
        .submit_project(project("clean", vec![task("a", "build", &[])]))
        .unwrap();
    assert_eq!(orch.status(&batch).unwrap().tasks.len(), 1);
}

#[tokio::test]
async fn test_review_approve_and_reject_flow() {
    // Given a worker whose results require gated approval
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["design".to_string()], 1),
        Arc::new(ReviewWorker),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project("gated", vec![task("schema", "design", &[])]))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let task_id = orch.status(&batch).unwrap().tasks[0].id;
    assert_eq!(
        orch.status(&batch).unwrap().counts.get("review"),
        Some(&1)
    );

    // When the first result is rejected, the task re-runs and returns
    // for review
    orch.reject(&task_id, "missing constraints").await.unwrap();
    orch.run_until_settled(&batch).await.unwrap();
    let reviewed = orch.status(&batch).unwrap();
    assert_eq!(reviewed.counts.get("review"), Some(&1));
    assert!(reviewed
        .decisions
        .iter()
        .any(|d| d.rationale.contains("missing constraints")));

    // Then approval completes the task and settles the batch
    orch.approve(&task_id).await.unwrap();
    let settled = orch.status(&batch).unwrap();
    assert!(settled.settled);
    assert_eq!(settled.counts["completed"], 1);
}

#[tokio::test]
async fn test_approve_non_review_task_fails_with_exit_code_3() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let batch = orch
        .submit_project(project("plain", vec![task("a", "build", &[])]))
        .unwrap();
    let task_id = orch.status(&batch).unwrap().tasks[0].id;

    let result = orch.approve(&task_id).await;
    assert!(matches!(result, Err(Error::NotInReview { .. })));
    assert_eq!(result.unwrap_err().exit_code(), 3);
}

#[tokio::test]
async fn test_cancel_batch_cascades() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    let batch = orch
        .submit_project(project(
            "doomed",
            vec![
                task_with_priority("a", "build", &[], Priority::High),
                task("b", "build", &["a"]),
                task("c", "build", &["b"]),
            ],
        ))
        .unwrap();

    orch.cancel(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert!(status.settled);
    assert_eq!(status.counts["cancelled"], 3);

    // Cancelling again is harmless: everything is already terminal
    orch.cancel(&batch).await.unwrap();
}

#[tokio::test]
async fn test_status_for_unknown_batch_is_not_found() {
    let dir = TempDir::new().unwrap();
    let orch = open_orchestrator(&dir).await;
    let result = orch.status(&conductor::core::task::BatchId::new());
    assert!(matches!(result, Err(Error::BatchNotFound(_))));
    assert_eq!(result.unwrap_err().exit_code(), 2);
}
