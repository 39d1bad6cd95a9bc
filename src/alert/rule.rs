//! Alert rule model and condition matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::plan::{AgentId, TaskId};
use crate::core::TaskError;
use crate::log::LogLevel;
use crate::orchestration::retry::TransitionEvent;

/// Agent filter value that matches every agent.
pub const ANY_AGENT: &str = "*";

fn default_enabled() -> bool {
    true
}

/// A condition/action pair evaluated against task outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: AlertCondition,
    pub action: AlertAction,
}

/// What an outcome must look like for a rule to fire.
///
/// Every field that is set must match; omitted fields impose no constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AlertCondition {
    /// Matches failure events from the retry controller.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        /// Fires once at least this many retries were already used when the
        /// attempt failed. The count is read before the failure's own
        /// transition, so a `RetryDispatched` event reports the retries
        /// spent before it and `1` first fires on the second failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_retry_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// Matches successful completions.
    TaskResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score_below: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score_above: Option<f64>,
        /// Attempt duration threshold in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_above: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
}

/// Notification to trigger when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AlertAction {
    Log {
        #[serde(default)]
        level: LogLevel,
        message_template: String,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body_template: String,
    },
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertAction::Log { .. } => "log",
            AlertAction::Webhook { .. } => "webhook",
        }
    }
}

/// One alert policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Error,
    TaskResult,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Error => write!(f, "Error"),
            EventType::TaskResult => write!(f, "TaskResult"),
        }
    }
}

/// Payload specific to the kind of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeDetail {
    Error {
        error: TaskError,
        transition: TransitionEvent,
    },
    TaskResult {
        score: Option<f64>,
        output: Option<serde_json::Value>,
        duration_secs: Option<f64>,
    },
}

/// A task outcome the alert engine evaluates rules against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcomeEvent {
    pub plan_id: String,
    pub task_id: TaskId,
    /// Agent that produced the outcome.
    pub agent: AgentId,
    pub timestamp: DateTime<Utc>,
    /// Retries consumed when the outcome was observed. For errors this is
    /// the count before the controller handled the failure.
    pub retry_count: u32,
    pub detail: OutcomeDetail,
}

impl TaskOutcomeEvent {
    pub fn event_type(&self) -> EventType {
        match self.detail {
            OutcomeDetail::Error { .. } => EventType::Error,
            OutcomeDetail::TaskResult { .. } => EventType::TaskResult,
        }
    }

    /// Human-readable summary used as the alert message.
    pub fn message(&self) -> String {
        match &self.detail {
            OutcomeDetail::Error { error, transition } => {
                format!("{} ({})", error, transition.event_type)
            }
            OutcomeDetail::TaskResult {
                score,
                duration_secs,
                ..
            } => {
                let mut msg = format!("task {} completed by {}", self.task_id, self.agent);
                if let Some(score) = score {
                    msg.push_str(&format!(", score {}", score));
                }
                if let Some(secs) = duration_secs {
                    msg.push_str(&format!(", {:.3}s", secs));
                }
                msg
            }
        }
    }
}

fn agent_matches(filter: &Option<String>, agent: &AgentId) -> bool {
    match filter.as_deref() {
        None | Some(ANY_AGENT) => true,
        Some(name) => name == agent.as_str(),
    }
}

impl AlertCondition {
    pub fn event_type(&self) -> EventType {
        match self {
            AlertCondition::Error { .. } => EventType::Error,
            AlertCondition::TaskResult { .. } => EventType::TaskResult,
        }
    }

    /// Whether this condition matches the outcome. Conditions only ever
    /// match outcomes of their own event type.
    pub fn matches(&self, event: &TaskOutcomeEvent) -> bool {
        match (self, &event.detail) {
            (
                AlertCondition::Error {
                    agent,
                    min_retry_count,
                    error_code,
                },
                OutcomeDetail::Error { error, .. },
            ) => {
                agent_matches(agent, &event.agent)
                    && min_retry_count.map_or(true, |min| min <= event.retry_count)
                    && error_code
                        .as_ref()
                        .map_or(true, |code| error.code.as_deref() == Some(code.as_str()))
            }
            (
                AlertCondition::TaskResult {
                    score_below,
                    score_above,
                    duration_above,
                    agent,
                },
                OutcomeDetail::TaskResult {
                    score,
                    duration_secs,
                    ..
                },
            ) => {
                // A threshold on a value the agent did not report cannot match.
                let below = score_below.map_or(true, |t| score.map_or(false, |s| s < t));
                let above = score_above.map_or(true, |t| score.map_or(false, |s| s > t));
                let slow = duration_above.map_or(true, |t| duration_secs.map_or(false, |d| d > t));
                below && above && slow && agent_matches(agent, &event.agent)
            }
            _ => false,
        }
    }
}

/// One firing of one rule for one outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_name: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub message: String,
    pub condition: AlertCondition,
    #[serde(skip)]
    pub outcome: Arc<TaskOutcomeEvent>,
}

impl AlertEvent {
    pub fn new(rule: &AlertRule, outcome: Arc<TaskOutcomeEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            task_id: outcome.task_id.clone(),
            agent_id: outcome.agent.clone(),
            timestamp: outcome.timestamp,
            event_type: outcome.event_type(),
            message: outcome.message(),
            condition: rule.condition.clone(),
            outcome,
        }
    }
}
