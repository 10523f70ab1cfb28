//! Conflict arbitration and idempotent event handling.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::bus::{topics, IdempotencyGuard, Message};
use conductor::core::task::{Priority, TaskId};
use conductor::orchestration::registry::AgentDescriptor;
use conductor::Error;

use crate::fixtures::{open_orchestrator, project, task, task_with_priority, EchoWorker};

#[tokio::test]
async fn test_priority_wins_and_is_audited() {
    // Given two completed tasks with contradictory results
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 2),
        Arc::new(EchoWorker),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project(
            "conflicting schemas",
            vec![
                task_with_priority("authoritative", "build", &[], Priority::High),
                task_with_priority("speculative", "build", &[], Priority::Low),
            ],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();

    let status = orch.status(&batch).unwrap();
    let high = status.tasks.iter().find(|t| t.priority == Priority::High).unwrap().id;
    let low = status.tasks.iter().find(|t| t.priority == Priority::Low).unwrap().id;

    // When the conflict is arbitrated
    let mut decisions_sub = orch_bus_subscription(&orch);
    let resolution = orch
        .resolve_conflict(&high, &low, "incompatible user schemas")
        .await
        .unwrap();

    // Then the higher-priority result wins and both sides are audited
    assert_eq!(resolution.winner, high);
    assert_eq!(resolution.loser, low);

    let status = orch.status(&batch).unwrap();
    assert!(status.decisions.iter().any(|d| d.task_id == high));
    assert!(status
        .decisions
        .iter()
        .any(|d| d.task_id == low && d.rationale.contains("discarded")));

    // A conflict.decision message was published
    let msg = decisions_sub.recv().await.unwrap();
    assert_eq!(msg.topic, topics::CONFLICT_DECISION);
    assert_eq!(msg.payload["rationale"], resolution.rationale);
}

#[tokio::test]
async fn test_equal_priority_escalates_not_discards() {
    let dir = TempDir::new().unwrap();
    let mut orch = open_orchestrator(&dir).await;
    orch.register_agent(
        AgentDescriptor::new(["build".to_string()], 2),
        Arc::new(EchoWorker),
    )
    .await
    .unwrap();

    let batch = orch
        .submit_project(project(
            "tie",
            vec![task("a", "build", &[]), task("b", "build", &[])],
        ))
        .unwrap();
    orch.run_until_settled(&batch).await.unwrap();
    let ids: Vec<TaskId> = orch
        .status(&batch)
        .unwrap()
        .tasks
        .iter()
        .map(|t| t.id)
        .collect();

    let result = orch
        .resolve_conflict(&ids[0], &ids[1], "incompatible user schemas")
        .await;

    assert!(matches!(result, Err(Error::ConflictUnresolved { .. })));
    assert_eq!(result.unwrap_err().exit_code(), 3);
    // Escalation is still audited for both tasks
    let status = orch.status(&batch).unwrap();
    assert!(status.decisions.iter().any(|d| d.task_id == ids[0]));
    assert!(status.decisions.iter().any(|d| d.task_id == ids[1]));
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    // At-least-once delivery: the same logical event published twice
    // must be acted on once.
    let task_id = TaskId::new();
    let payload = serde_json::json!({ "outcome": "success", "result": { "n": 1 } });
    let first = Message::new(topics::TASK_RESULT, Some(task_id), payload.clone());
    let redelivery = Message::new(topics::TASK_RESULT, Some(task_id), payload);

    let mut guard = IdempotencyGuard::new();
    let mut applied = 0;
    for msg in [&first, &redelivery] {
        if guard.first_delivery(msg) {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    // A different payload for the same task is a new event
    let changed = Message::new(
        topics::TASK_RESULT,
        Some(task_id),
        serde_json::json!({ "outcome": "success", "result": { "n": 2 } }),
    );
    assert!(guard.first_delivery(&changed));
}

fn orch_bus_subscription(orch: &conductor::Orchestrator) -> conductor::bus::Subscription {
    orch.subscribe(topics::CONFLICT_DECISION)
}
