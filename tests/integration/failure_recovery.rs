//! Failure paths: timeouts, retry with backoff, and cascade cancellation.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use conductor::core::task::{ErrorKind, TaskStatus};
use conductor::orchestration::registry::AgentDescriptor;

use crate::fixtures::{
    open_orchestrator, project, task, AlwaysFails, EchoWorker, FirstCallSleeper, FlakyWorker,
    StubbornSleeper,
};

#[tokio::test]
async fn test_timeout_forces_error_with_timeout_kind() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["slow".to_string()], 1),
        Arc::new(StubbornSleeper),
    )
    .await
    .unwrap();
    orch.set_capability_timeout("slow", Duration::from_millis(20));

    let mut doomed = task("sleepy", "slow", &[]);
    doomed.max_attempts = Some(1);
    let batch = orch.submit_project(project("timeout", vec![doomed])).unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert_eq!(status.counts["error"], 1);
    let failed = &status.tasks[0];
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_timeout_retried_within_attempt_limit() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["slow".to_string()], 1),
        Arc::new(FirstCallSleeper::new()),
    )
    .await
    .unwrap();
    orch.set_capability_timeout("slow", Duration::from_millis(20));

    let batch = orch
        .submit_project(project("slow start", vec![task("warmup", "slow", &[])]))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    // Attempt one timed out; the retry succeeded within max_attempts
    let status = orch.status(&batch).unwrap();
    assert_eq!(status.counts["completed"], 1);
    assert_eq!(status.tasks[0].attempt, 2);

    let events = orch.stream_events(&batch, 0).unwrap().replay;
    let errors = events.iter().filter(|e| e.to == TaskStatus::Error).count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_retry_succeeds_after_flakes() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 1),
        Arc::new(FlakyWorker::new(3)),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project("flaky", vec![task("t", "build", &[])]))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert_eq!(status.counts["completed"], 1);
    // Two failures, then success on the third attempt
    assert_eq!(status.tasks[0].attempt, 3);

    // The intermediate failures are visible in the event history
    let events = orch.stream_events(&batch, 0).unwrap().replay;
    let errors = events.iter().filter(|e| e.to == TaskStatus::Error).count();
    assert_eq!(errors, 2);
}

#[tokio::test]
async fn test_exhausted_retries_cancel_transitive_dependents() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["bad".to_string(), "build".to_string()], 2),
        Arc::new(AlwaysFails),
    )
    .await
    .unwrap();

    let mut root = task("root", "bad", &[]);
    root.max_attempts = Some(2);
    let batch = orch
        .submit_project(project(
            "cascade",
            vec![
                root,
                task("mid", "build", &["root"]),
                task("leaf", "build", &["mid"]),
            ],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert!(status.settled);
    assert_eq!(status.counts["error"], 1);
    assert_eq!(status.counts["cancelled"], 2);

    let root_task = status
        .tasks
        .iter()
        .find(|t| t.status == TaskStatus::Error)
        .unwrap();
    assert_eq!(root_task.attempt, 2);
    assert_eq!(
        root_task.error.as_ref().unwrap().kind,
        ErrorKind::WorkerFailure
    );
    // The exhaustion decision is audited
    assert!(status
        .decisions
        .iter()
        .any(|d| d.rationale.contains("attempts exhausted")));
}

#[tokio::test]
async fn test_failure_in_one_branch_leaves_other_branch_alone() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["bad".to_string()], 1),
        Arc::new(AlwaysFails),
    )
    .await
    .unwrap();
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 1),
        Arc::new(EchoWorker),
    )
    .await
    .unwrap();

    let mut bad = task("bad", "bad", &[]);
    bad.max_attempts = Some(1);
    let batch = orch
        .submit_project(project(
            "branches",
            vec![
                bad,
                task("bad-child", "build", &["bad"]),
                task("good", "build", &[]),
                task("good-child", "build", &["good"]),
            ],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    assert_eq!(status.counts["completed"], 2);
    assert_eq!(status.counts["error"], 1);
    assert_eq!(status.counts["cancelled"], 1);
}
