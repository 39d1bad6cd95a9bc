//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted agents (`ScriptedDispatcher`)
//! - Recording alert delivery (`RecordingPort`)
//! - Predefined plans and alert rules
//! - An orchestrator wired to both fakes with an event channel
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use baton::alert::{
    AlertAction, AlertActionError, AlertActionPort, AlertCondition, AlertEngine, AlertEvent,
    AlertRule, PolicySet, RuleSet,
};
use baton::core::{AgentId, Plan, TaskId, TaskSpec, TaskStatus};
use baton::log::LogLevel;
use baton::orchestration::{
    AgentDispatcher, DispatchRequest, DispatchResult, RetryPolicy, TransitionKind,
};
use baton::{Orchestrator, SchedulerEvent};

/// One scripted response of an agent.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer at once.
    Reply(DispatchResult),
    /// Answer after the delay.
    After(Duration, DispatchResult),
    /// Never answer.
    Hang,
}

/// Agent stand-in that replays scripted steps per (task, agent).
///
/// Dispatches without a script succeed at once. Every request is recorded,
/// as is a `start:<task>` / `end:<task>` timeline for ordering checks.
#[derive(Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<(String, String), VecDeque<Step>>>,
    requests: Mutex<Vec<DispatchRequest>>,
    timeline: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for `task` when dispatched to `agent`.
    pub fn script(self, task: &str, agent: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .entry((task.to_string(), agent.to_string()))
            .or_default()
            .extend(steps);
        self
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    /// Task ids in the order they were dispatched.
    pub fn dispatched(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.task_id.to_string())
            .collect()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, request: &DispatchRequest) -> Step {
        let key = (request.task_id.to_string(), request.agent.to_string());
        self.scripts
            .lock()
            .get_mut(&key)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Reply(DispatchResult::success()))
    }
}

#[async_trait]
impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        let step = self.next_step(&request);
        let task = request.task_id.to_string();
        self.requests.lock().push(request);
        self.timeline.lock().push(format!("start:{}", task));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match step {
            Step::Reply(result) => result,
            Step::After(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            Step::Hang => std::future::pending().await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.timeline.lock().push(format!("end:{}", task));
        result
    }

    async fn cancel(&self, _plan_id: &str, task_id: &TaskId, _agent: &AgentId) {
        self.cancelled.lock().push(task_id.to_string());
    }
}

/// Alert action port that records every alert, optionally failing some.
#[derive(Default)]
pub struct RecordingPort {
    alerts: Mutex<Vec<AlertEvent>>,
    fail_all: bool,
}

impl RecordingPort {
    pub fn failing() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            fail_all: true,
        }
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().clone()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.alerts
            .lock()
            .iter()
            .map(|a| a.rule_name.clone())
            .collect()
    }
}

#[async_trait]
impl AlertActionPort for RecordingPort {
    async fn execute(&self, _action: &AlertAction, alert: &AlertEvent) -> Result<(), AlertActionError> {
        self.alerts.lock().push(alert.clone());
        if self.fail_all {
            return Err(AlertActionError::Other("webhook unreachable".to_string()));
        }
        Ok(())
    }
}

/// Orchestrator plus the fakes behind it.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub port: Arc<RecordingPort>,
    pub events: mpsc::Receiver<SchedulerEvent>,
}

impl Harness {
    /// Everything emitted so far. Complete once `wait` has returned.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block until `task` enters `status`, consuming events on the way.
    pub async fn wait_for_status(&mut self, task: &str, status: TaskStatus) {
        while let Some(event) = self.events.recv().await {
            if let SchedulerEvent::TaskStateChanged { task_id, to, .. } = &event {
                if task_id.as_str() == task && *to == status {
                    return;
                }
            }
        }
        panic!("event stream closed before {} reached {}", task, status);
    }
}

/// Harness with immediate retries.
pub fn harness(dispatcher: ScriptedDispatcher, rules: Vec<AlertRule>) -> Harness {
    harness_with(dispatcher, RecordingPort::default(), rules, RetryPolicy::immediate())
}

pub fn harness_with(
    dispatcher: ScriptedDispatcher,
    port: RecordingPort,
    rules: Vec<AlertRule>,
    retry: RetryPolicy,
) -> Harness {
    let dispatcher = Arc::new(dispatcher);
    let port = Arc::new(port);
    let alerts = Arc::new(AlertEngine::new(
        RuleSet::from_sets([policy(rules)]),
        port.clone(),
    ));
    let (orchestrator, events) = Orchestrator::new(dispatcher.clone(), alerts)
        .with_retry_policy(retry)
        .with_event_channel(1024);
    Harness {
        orchestrator,
        dispatcher,
        port,
        events,
    }
}

pub fn policy(rules: Vec<AlertRule>) -> PolicySet {
    PolicySet {
        version: "1".to_string(),
        description: "integration".to_string(),
        rules,
    }
}

fn log_action() -> AlertAction {
    AlertAction::Log {
        level: LogLevel::Warn,
        message_template: "{{.Name}}: {{.Message}}".to_string(),
    }
}

pub fn low_score_rule(name: &str, below: f64) -> AlertRule {
    AlertRule {
        name: name.to_string(),
        enabled: true,
        condition: AlertCondition::TaskResult {
            score_below: Some(below),
            score_above: None,
            duration_above: None,
            agent: None,
        },
        action: log_action(),
    }
}

pub fn error_rule(name: &str, agent: Option<&str>, min_retry_count: Option<u32>) -> AlertRule {
    AlertRule {
        name: name.to_string(),
        enabled: true,
        condition: AlertCondition::Error {
            agent: agent.map(str::to_string),
            min_retry_count,
            error_code: None,
        },
        action: log_action(),
    }
}

/// A -> B -> C on one agent.
pub fn linear_plan(plan_id: &str) -> Plan {
    Plan::new(plan_id)
        .with_task(TaskSpec::new("A", "worker"))
        .with_task(TaskSpec::new("B", "worker").depends_on("A"))
        .with_task(TaskSpec::new("C", "worker").depends_on("B"))
}

/// A -> {B, C} -> D.
pub fn diamond_plan(plan_id: &str) -> Plan {
    Plan::new(plan_id)
        .with_task(TaskSpec::new("A", "worker"))
        .with_task(TaskSpec::new("B", "worker").depends_on("A"))
        .with_task(TaskSpec::new("C", "worker").depends_on("A"))
        .with_task(TaskSpec::new("D", "worker").depends_on("B").depends_on("C"))
}

pub fn transitions(events: &[SchedulerEvent], task: &str) -> Vec<TransitionKind> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::Transition { event, .. } if event.task_id.as_str() == task => {
                Some(event.event_type)
            }
            _ => None,
        })
        .collect()
}

pub fn status_changes(events: &[SchedulerEvent], task: &str) -> Vec<TaskStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskStateChanged { task_id, to, .. } if task_id.as_str() == task => {
                Some(*to)
            }
            _ => None,
        })
        .collect()
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}
