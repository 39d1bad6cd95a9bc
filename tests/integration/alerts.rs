//! Alert policy tests.
//!
//! These verify which outcomes fire which rules, that alerts never affect
//! task state, and that policy files and webhook actions work end to end.

use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use baton::alert::{
    ActionExecutor, AlertAction, AlertActionPort, AlertCondition, AlertEngine, AlertRule,
    EventType, OutcomeDetail, RuleSet,
};
use baton::config::Config;
use baton::core::{Plan, PlanStatus, TaskSpec, TaskStatus};
use baton::orchestration::{DispatchResult, RetryPolicy, TransitionKind};
use baton::Orchestrator;

use crate::fixtures::{
    error_rule, harness, harness_with, id, low_score_rule, policy, RecordingPort,
    ScriptedDispatcher, Step,
};

/// Test: a score threshold fires only for results below it.
///
/// Given: A rule firing on TaskResult score_below 0.7
/// When: X scores 0.65 and Y scores 0.75
/// Then: Exactly one alert fires, for X, carrying the task and agent ids
#[tokio::test]
async fn test_low_score_alert() {
    let dispatcher = ScriptedDispatcher::new()
        .script("X", "grader", vec![Step::Reply(DispatchResult::with_score(0.65))])
        .script("Y", "grader", vec![Step::Reply(DispatchResult::with_score(0.75))]);
    let h = harness(dispatcher, vec![low_score_rule("low-quality", 0.7)]);

    h.orchestrator
        .submit(
            Plan::new("scores")
                .with_task(TaskSpec::new("X", "grader"))
                .with_task(TaskSpec::new("Y", "grader")),
        )
        .await
        .unwrap();
    assert_eq!(h.orchestrator.wait("scores").await.unwrap(), PlanStatus::Succeeded);

    let alerts = h.port.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_name, "low-quality");
    assert_eq!(alerts[0].task_id.as_str(), "X");
    assert_eq!(alerts[0].agent_id.as_str(), "grader");
    assert_eq!(alerts[0].event_type, EventType::TaskResult);
}

/// Test: several rules can fire for one outcome.
///
/// Given: An any-agent error rule, a rule scoped to "worker" and one scoped
///        to a different agent
/// When: A task on "worker" fails once
/// Then: The two matching rules fire independently, in policy order
#[tokio::test]
async fn test_rules_fire_independently() {
    let dispatcher = ScriptedDispatcher::new().script(
        "A",
        "worker",
        vec![Step::Reply(DispatchResult::error("boom"))],
    );
    let h = harness(
        dispatcher,
        vec![
            error_rule("any-error", Some("*"), None),
            error_rule("worker-error", Some("worker"), None),
            error_rule("other-error", Some("other"), None),
        ],
    );

    h.orchestrator
        .submit(Plan::new("errors").with_task(TaskSpec::new("A", "worker")))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.wait("errors").await.unwrap(), PlanStatus::Failed);

    assert_eq!(h.port.rule_names(), vec!["any-error", "worker-error"]);
    for alert in h.port.alerts() {
        assert_eq!(alert.event_type, EventType::Error);
        assert!(alert.message.contains("boom"));
    }
}

/// Test: min_retry_count compares against the retries already consumed.
///
/// Given: A rule with min_retry_count = 1 and a task with max_retries = 1
///        that fails both attempts
/// When: The plan runs
/// Then: Only the second failure fires, and it carries the permanent failure
#[tokio::test]
async fn test_min_retry_count_threshold() {
    let dispatcher = ScriptedDispatcher::new().script(
        "A",
        "worker",
        vec![
            Step::Reply(DispatchResult::error("first")),
            Step::Reply(DispatchResult::error("second")),
        ],
    );
    let h = harness(dispatcher, vec![error_rule("repeat", None, Some(1))]);

    h.orchestrator
        .submit(Plan::new("repeat").with_task(TaskSpec::new("A", "worker").with_max_retries(1)))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.wait("repeat").await.unwrap(), PlanStatus::Failed);

    let alerts = h.port.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].outcome.retry_count, 1);
    match &alerts[0].outcome.detail {
        OutcomeDetail::Error { error, transition } => {
            assert_eq!(error.message, "second");
            assert_eq!(transition.event_type, TransitionKind::PermanentlyFailed);
        }
        other => panic!("expected an error outcome, got {:?}", other),
    }
}

/// Test: a failing alert action has no effect on execution.
///
/// Given: A port whose every action fails and a rule matching every result
/// When: A linear plan runs
/// Then: Every alert was attempted and the plan still succeeds
#[tokio::test]
async fn test_failing_action_does_not_affect_tasks() {
    let h = harness_with(
        ScriptedDispatcher::new()
            .script("A", "worker", vec![Step::Reply(DispatchResult::with_score(0.1))])
            .script("B", "worker", vec![Step::Reply(DispatchResult::with_score(0.1))]),
        RecordingPort::failing(),
        vec![low_score_rule("always", 1.0)],
        RetryPolicy::immediate(),
    );

    h.orchestrator
        .submit(
            Plan::new("noisy")
                .with_task(TaskSpec::new("A", "worker"))
                .with_task(TaskSpec::new("B", "worker").depends_on("A")),
        )
        .await
        .unwrap();
    assert_eq!(h.orchestrator.wait("noisy").await.unwrap(), PlanStatus::Succeeded);
    assert_eq!(h.port.alerts().len(), 2);
    assert_eq!(
        h.orchestrator.task_status("noisy", &id("B")).unwrap().status,
        TaskStatus::Succeeded
    );
}

/// Test: disabled rules and reloads.
///
/// Given: A disabled rule that would match
/// When: The plan runs, then the engine is reloaded with the rule enabled
/// Then: Nothing fires before the reload and the next plan fires once
#[tokio::test]
async fn test_disabled_rule_and_reload() {
    let mut rule = low_score_rule("gated", 1.0);
    rule.enabled = false;
    let dispatcher = ScriptedDispatcher::new()
        .script("A", "worker", vec![Step::Reply(DispatchResult::with_score(0.5))])
        .script("A", "worker", vec![Step::Reply(DispatchResult::with_score(0.5))]);
    let h = harness(dispatcher, vec![rule.clone()]);

    h.orchestrator
        .submit(Plan::new("first").with_task(TaskSpec::new("A", "worker")))
        .await
        .unwrap();
    h.orchestrator.wait("first").await.unwrap();
    assert!(h.port.alerts().is_empty());

    rule.enabled = true;
    h.orchestrator.alerts().reload([policy(vec![rule])]);
    h.orchestrator
        .submit(Plan::new("second").with_task(TaskSpec::new("A", "worker")))
        .await
        .unwrap();
    h.orchestrator.wait("second").await.unwrap();
    assert_eq!(h.port.rule_names(), vec!["gated"]);
}

/// Test: policy files from the config are merged in order.
///
/// Given: A TOML base policy with threshold 0.5 and a JSON override of the
///        same rule with threshold 0.9
/// When: A task scores 0.7
/// Then: The override is in effect and the alert fires
#[tokio::test]
async fn test_policy_files_from_config() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.toml");
    std::fs::write(
        &base,
        r#"
version = "1"
description = "team defaults"

[[rules]]
name = "low"

[rules.condition]
type = "task_result"
score_below = 0.5

[rules.action]
type = "log"
message_template = "{{.Name}} fired for {{.TaskID}}"
"#,
    )
    .unwrap();
    let override_path = dir.path().join("override.json");
    std::fs::write(
        &override_path,
        r#"{
            "version": "2",
            "rules": [{
                "name": "low",
                "condition": {"type": "task_result", "score_below": 0.9},
                "action": {"type": "log", "level": "error", "message_template": "{{.Message}}"}
            }]
        }"#,
    )
    .unwrap();

    let config = Config {
        policy_files: vec![
            base.to_string_lossy().into_owned(),
            override_path.to_string_lossy().into_owned(),
        ],
        ..Config::default()
    };
    let port = Arc::new(RecordingPort::default());
    let orchestrator = Orchestrator::from_config(
        &config,
        Arc::new(
            ScriptedDispatcher::new()
                .script("A", "worker", vec![Step::Reply(DispatchResult::with_score(0.7))]),
        ),
        Some(port.clone() as Arc<dyn AlertActionPort>),
    )
    .unwrap();
    assert_eq!(orchestrator.alerts().rules().len(), 1);

    orchestrator
        .submit(Plan::new("policies").with_task(TaskSpec::new("A", "worker")))
        .await
        .unwrap();
    assert_eq!(orchestrator.wait("policies").await.unwrap(), PlanStatus::Succeeded);
    assert_eq!(port.rule_names(), vec!["low"]);
}

/// Accept one HTTP request, answer 200 and return the raw request text.
async fn one_shot_server() -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8_lossy(&request).into_owned()
    });
    (url, handle)
}

/// Test: webhook actions post the rendered body with configured headers.
///
/// Given: A webhook rule with a body template and a custom header, pointing
///        at a loopback listener
/// When: A task result matches the rule
/// Then: The listener receives a POST with the header and rendered body
#[tokio::test]
async fn test_webhook_action_posts_rendered_body() {
    let (url, server) = one_shot_server().await;
    let mut headers = BTreeMap::new();
    headers.insert("X-Alert-Token".to_string(), "secret".to_string());
    let rule = AlertRule {
        name: "hook".to_string(),
        enabled: true,
        condition: AlertCondition::TaskResult {
            score_below: Some(0.5),
            score_above: None,
            duration_above: None,
            agent: Some("*".to_string()),
        },
        action: AlertAction::Webhook {
            url,
            headers,
            body_template: r#"{"rule":"{{.Name}}","task":"{{.TaskID}}","agent":"{{.AgentID}}"}"#
                .to_string(),
        },
    };
    let alerts = Arc::new(AlertEngine::new(
        RuleSet::from_sets([policy(vec![rule])]),
        Arc::new(ActionExecutor::with_client(
            reqwest::Client::builder().no_proxy().build().unwrap(),
        )),
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(
            ScriptedDispatcher::new()
                .script("A", "worker", vec![Step::Reply(DispatchResult::with_score(0.2))]),
        ),
        alerts,
    );

    orchestrator
        .submit(Plan::new("hooked").with_task(TaskSpec::new("A", "worker")))
        .await
        .unwrap();
    assert_eq!(orchestrator.wait("hooked").await.unwrap(), PlanStatus::Succeeded);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /hook HTTP/1.1"));
    let lowered = request.to_lowercase();
    assert!(lowered.contains("x-alert-token: secret"));
    assert!(lowered.contains("content-type: application/json"));
    assert!(request.ends_with(r#"{"rule":"hook","task":"A","agent":"worker"}"#));
}
