//! Retry and fallback decisions for failed tasks.
//!
//! When an attempt fails (agent error, transport error or timeout) the
//! controller picks exactly one next move, evaluated in order:
//!
//! 1. retry on the same agent while `retry_count < max_retries`
//! 2. escalate once to the task's `fallback_agent`
//! 3. retry on the fallback agent while the policy's fallback budget lasts
//!    (zero by default)
//! 4. give up: the task becomes `PermanentlyFailed`
//!
//! Every transition produces a [`TransitionEvent`], which is both the audit
//! trail and what error alert rules observe.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::plan::{AgentId, TaskId, TaskSpec};
use crate::core::{TaskError, TaskExecutionState, TaskStatus};

/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;

/// Default growth factor between consecutive retries.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default upper bound on a single retry delay.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Delay applied before re-dispatching a failed task.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Delay before the `retry`-th retry (1-based). Zero for `retry == 0`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let millis = self.initial.as_millis() as f64 * factor;
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Tunables for the controller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    /// Retries allowed on the fallback agent after escalation.
    pub fallback_retries: u32,
}

impl RetryPolicy {
    /// No backoff and no fallback retries.
    pub fn immediate() -> Self {
        Self {
            backoff: BackoffPolicy::none(),
            fallback_retries: 0,
        }
    }

    pub fn with_fallback_retries(mut self, retries: u32) -> Self {
        self.fallback_retries = retries;
        self
    }
}

/// Next move for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-dispatch to the same agent after `delay`.
    Retry { agent: AgentId, delay: Duration },
    /// Switch to the fallback agent and dispatch immediately.
    Fallback { from: AgentId, to: AgentId },
    /// Re-dispatch to the fallback agent after `delay`.
    FallbackRetry { agent: AgentId, delay: Duration },
    /// Retries and fallback are exhausted.
    GiveUp,
}

impl RetryDecision {
    /// Delay before the next dispatch, if any dispatch follows.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { delay, .. } | RetryDecision::FallbackRetry { delay, .. } => {
                Some(*delay)
            }
            RetryDecision::Fallback { .. } => Some(Duration::ZERO),
            RetryDecision::GiveUp => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    RetryDispatched,
    FallbackTriggered,
    FallbackSucceeded,
    PermanentlyFailed,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionKind::RetryDispatched => "retry_dispatched",
            TransitionKind::FallbackTriggered => "fallback_triggered",
            TransitionKind::FallbackSucceeded => "fallback_succeeded",
            TransitionKind::PermanentlyFailed => "permanently_failed",
        };
        write!(f, "{}", s)
    }
}

/// Structured record of a retry/fallback transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub event_type: TransitionKind,
    pub task_id: TaskId,
    pub from_agent: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<AgentId>,
    pub message: String,
}

/// Decide the next move without touching the state.
pub fn decide(spec: &TaskSpec, state: &TaskExecutionState, policy: &RetryPolicy) -> RetryDecision {
    let on_fallback = state.current_agent != spec.agent;

    if !on_fallback && state.retry_count < spec.max_retries {
        return RetryDecision::Retry {
            agent: state.current_agent.clone(),
            delay: policy.backoff.delay_for(state.retry_count + 1),
        };
    }

    if !on_fallback {
        if let Some(fallback) = &spec.fallback_agent {
            if *fallback != state.current_agent {
                return RetryDecision::Fallback {
                    from: state.current_agent.clone(),
                    to: fallback.clone(),
                };
            }
        }
    }

    if on_fallback && state.fallback_retry_count < policy.fallback_retries {
        return RetryDecision::FallbackRetry {
            agent: state.current_agent.clone(),
            delay: policy.backoff.delay_for(state.fallback_retry_count + 1),
        };
    }

    RetryDecision::GiveUp
}

/// Applies retry decisions to task state.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt and move the task to its next state.
    ///
    /// The state must be in `Running` or `FallbackRunning`; the latest
    /// attempt is expected to be closed by the caller.
    pub fn handle_failure(
        &self,
        spec: &TaskSpec,
        state: &mut TaskExecutionState,
        error: TaskError,
    ) -> (RetryDecision, TransitionEvent) {
        state.transition(TaskStatus::Failed);
        state.last_error = Some(error.clone());

        let decision = decide(spec, state, &self.policy);
        let from_agent = state.current_agent.clone();
        let event = match &decision {
            RetryDecision::Retry { agent, delay } => {
                state.retry_count += 1;
                state.transition(TaskStatus::Running);
                TransitionEvent {
                    event_type: TransitionKind::RetryDispatched,
                    task_id: spec.task_id.clone(),
                    from_agent,
                    to_agent: Some(agent.clone()),
                    message: format!(
                        "retry {}/{} after {:?}: {}",
                        state.retry_count, spec.max_retries, delay, error
                    ),
                }
            }
            RetryDecision::Fallback { to, .. } => {
                state.current_agent = to.clone();
                state.transition(TaskStatus::FallbackRunning);
                TransitionEvent {
                    event_type: TransitionKind::FallbackTriggered,
                    task_id: spec.task_id.clone(),
                    from_agent,
                    to_agent: Some(to.clone()),
                    message: format!(
                        "retries exhausted ({}/{}), escalating: {}",
                        state.retry_count, spec.max_retries, error
                    ),
                }
            }
            RetryDecision::FallbackRetry { agent, delay } => {
                state.fallback_retry_count += 1;
                state.transition(TaskStatus::FallbackRunning);
                TransitionEvent {
                    event_type: TransitionKind::RetryDispatched,
                    task_id: spec.task_id.clone(),
                    from_agent,
                    to_agent: Some(agent.clone()),
                    message: format!(
                        "fallback retry {}/{} after {:?}: {}",
                        state.fallback_retry_count, self.policy.fallback_retries, delay, error
                    ),
                }
            }
            RetryDecision::GiveUp => {
                state.transition(TaskStatus::PermanentlyFailed);
                TransitionEvent {
                    event_type: TransitionKind::PermanentlyFailed,
                    task_id: spec.task_id.clone(),
                    from_agent,
                    to_agent: None,
                    message: format!("giving up after {} attempts: {}", state.attempts.len(), error),
                }
            }
        };

        match event.event_type {
            TransitionKind::PermanentlyFailed => warn!(
                task_id = %event.task_id,
                from_agent = %event.from_agent,
                event_type = %event.event_type,
                "{}",
                event.message
            ),
            _ => info!(
                task_id = %event.task_id,
                from_agent = %event.from_agent,
                to_agent = ?event.to_agent.as_ref().map(|a| a.as_str()),
                event_type = %event.event_type,
                "{}",
                event.message
            ),
        }

        (decision, event)
    }

    /// Transition event for a success, emitted only when the task succeeded
    /// on its fallback agent.
    pub fn success_event(&self, spec: &TaskSpec, state: &TaskExecutionState) -> Option<TransitionEvent> {
        if !state.succeeded_via_fallback(spec) {
            return None;
        }
        let event = TransitionEvent {
            event_type: TransitionKind::FallbackSucceeded,
            task_id: spec.task_id.clone(),
            from_agent: spec.agent.clone(),
            to_agent: Some(state.current_agent.clone()),
            message: format!("succeeded on fallback agent {}", state.current_agent),
        };
        info!(
            task_id = %event.task_id,
            event_type = %event.event_type,
            "{}",
            event.message
        );
        Some(event)
    }
}
