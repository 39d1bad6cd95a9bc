//! Approval gate tests.

use baton::core::{Plan, PlanStatus, TaskSpec, TaskStatus};
use baton::Error;

use crate::fixtures::{harness, id, status_changes, ScriptedDispatcher};

fn gated_plan(plan_id: &str) -> Plan {
    Plan::new(plan_id)
        .with_task(TaskSpec::new("A", "worker").with_approval())
        .with_task(TaskSpec::new("B", "worker").depends_on("A"))
}

/// Test: rejecting an approval skips the task and its dependents.
///
/// Given: A (approval required) -> B
/// When: A is rejected with a reason
/// Then: Nothing is dispatched, both tasks are Skipped and the plan
///       finishes PartiallySkipped
#[tokio::test]
async fn test_reject_skips_dependents() {
    let mut h = harness(ScriptedDispatcher::new(), vec![]);
    h.orchestrator.submit(gated_plan("reject")).await.unwrap();
    h.wait_for_status("A", TaskStatus::AwaitingApproval).await;

    h.orchestrator
        .reject("reject", &id("A"), Some("change freeze".to_string()))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.wait("reject").await.unwrap(),
        PlanStatus::PartiallySkipped
    );

    let a = h.orchestrator.task_status("reject", &id("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Skipped);
    assert!(a.skip_reason.unwrap().contains("change freeze"));
    let b = h.orchestrator.task_status("reject", &id("B")).unwrap();
    assert_eq!(b.status, TaskStatus::Skipped);
    assert!(b.skip_reason.unwrap().contains("rejected"));
    assert!(h.dispatcher.dispatched().is_empty());
}

/// Test: approving releases the task to its agent.
///
/// Given: A (approval required) -> B
/// When: A is approved
/// Then: A and B run in order and the plan succeeds
#[tokio::test]
async fn test_approve_runs_task() {
    let mut h = harness(ScriptedDispatcher::new(), vec![]);
    h.orchestrator.submit(gated_plan("approve")).await.unwrap();
    h.wait_for_status("A", TaskStatus::AwaitingApproval).await;
    assert!(h.dispatcher.dispatched().is_empty());

    h.orchestrator.approve("approve", &id("A")).await.unwrap();
    assert_eq!(h.orchestrator.wait("approve").await.unwrap(), PlanStatus::Succeeded);
    assert_eq!(h.dispatcher.dispatched(), vec!["A", "B"]);

    let events = h.drain_events();
    assert_eq!(
        status_changes(&events, "A"),
        vec![TaskStatus::Running, TaskStatus::Succeeded]
    );
}

/// Test: a gate further down the graph opens only after its dependencies.
///
/// Given: A -> B (approval required)
/// When: The plan runs
/// Then: B waits in AwaitingApproval after A succeeds, and runs once approved
#[tokio::test]
async fn test_gate_waits_for_dependencies() {
    let mut h = harness(ScriptedDispatcher::new(), vec![]);
    h.orchestrator
        .submit(
            Plan::new("late-gate")
                .with_task(TaskSpec::new("A", "worker"))
                .with_task(TaskSpec::new("B", "worker").depends_on("A").with_approval()),
        )
        .await
        .unwrap();
    h.wait_for_status("B", TaskStatus::AwaitingApproval).await;

    assert_eq!(
        h.orchestrator.task_status("late-gate", &id("A")).unwrap().status,
        TaskStatus::Succeeded
    );
    assert_eq!(h.orchestrator.plan_status("late-gate").unwrap(), PlanStatus::Running);

    h.orchestrator.approve("late-gate", &id("B")).await.unwrap();
    assert_eq!(
        h.orchestrator.wait("late-gate").await.unwrap(),
        PlanStatus::Succeeded
    );
}

/// Test: approval decisions are only accepted for waiting tasks.
///
/// Given: A (approval required) -> B
/// When: B (still blocked) is approved, and A is approved twice
/// Then: The blocked and the repeated approvals are refused
#[tokio::test]
async fn test_approve_requires_awaiting_task() {
    let mut h = harness(ScriptedDispatcher::new(), vec![]);
    h.orchestrator.submit(gated_plan("strict")).await.unwrap();
    h.wait_for_status("A", TaskStatus::AwaitingApproval).await;

    let err = h.orchestrator.approve("strict", &id("B")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotAwaitingApproval { ref task, .. } if task.as_str() == "B"
    ));

    h.orchestrator.approve("strict", &id("A")).await.unwrap();
    let again = h.orchestrator.approve("strict", &id("A")).await;
    assert!(matches!(
        again,
        Err(Error::NotAwaitingApproval { .. }) | Err(Error::PlanFinished(_))
    ));

    assert_eq!(h.orchestrator.wait("strict").await.unwrap(), PlanStatus::Succeeded);
    assert!(matches!(
        h.orchestrator.reject("strict", &id("A"), None).await,
        Err(Error::PlanFinished(_))
    ));
}
