//! Execution state for tasks of a running plan.
//!
//! State is kept in an arena indexed by the task's position in the plan.
//! Every slot has its own lock, so updates to different tasks never contend
//! and readers (status queries, dashboards) lock one task at a time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::dag::ValidatedPlan;
use crate::core::plan::{AgentId, TaskId, TaskSpec};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Dependencies satisfied (or none), not yet dispatched.
    Pending,
    /// Waiting on dependencies that have not succeeded yet.
    Blocked,
    /// Waiting for an external approval decision.
    AwaitingApproval,
    /// Dispatched to the primary agent.
    Running,
    /// Latest attempt failed; the retry controller has not decided yet.
    Failed,
    /// Dispatched to the fallback agent.
    FallbackRunning,
    Succeeded,
    PermanentlyFailed,
    Skipped,
}

impl TaskStatus {
    /// Terminal states are never left once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::PermanentlyFailed | TaskStatus::Skipped
        )
    }

    /// States in which an agent result may be applied.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::FallbackRunning)
    }

    /// Not yet started: eligible for skip propagation.
    pub fn is_unstarted(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::AwaitingApproval
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
            TaskStatus::FallbackRunning => "fallback_running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::PermanentlyFailed => "permanently_failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Error reported for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Machine-readable code, e.g. `"timeout"` or an agent-defined code.
    pub code: Option<String>,
    pub message: String,
}

impl TaskError {
    pub const TIMEOUT: &'static str = "timeout";

    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self {
            code: Some(Self::TIMEOUT.to_string()),
            message: format!("no result within {:?}", after),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code.as_deref() == Some(Self::TIMEOUT)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// One dispatch of a task to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number within the task.
    pub attempt: u32,
    pub agent: AgentId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<TaskError>,
}

impl AttemptRecord {
    /// Attempt duration in seconds, if it has completed.
    pub fn duration_secs(&self) -> Option<f64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Mutable execution state of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionState {
    pub status: TaskStatus,
    /// Retries consumed on the primary agent.
    pub retry_count: u32,
    /// Retries consumed on the fallback agent.
    #[serde(default)]
    pub fallback_retry_count: u32,
    pub current_agent: AgentId,
    pub attempts: Vec<AttemptRecord>,
    pub score: Option<f64>,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<TaskError>,
    pub skip_reason: Option<String>,
}

impl TaskExecutionState {
    pub fn new(spec: &TaskSpec) -> Self {
        let status = if spec.dependencies.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        Self {
            status,
            retry_count: 0,
            fallback_retry_count: 0,
            current_agent: spec.agent.clone(),
            attempts: Vec::new(),
            score: None,
            output: None,
            last_error: None,
            skip_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of the latest attempt, 0 before the first dispatch.
    pub fn current_attempt(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Move to `status` unless the task is already terminal.
    ///
    /// Returns false (and leaves the state untouched) for terminal tasks.
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// Record a new attempt on `current_agent` and return its number.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = self.current_attempt() + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            agent: self.current_agent.clone(),
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            error: None,
        });
        attempt
    }

    /// Close the latest open attempt.
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome, error: Option<TaskError>) {
        if let Some(last) = self.attempts.last_mut() {
            if last.outcome.is_none() {
                last.completed_at = Some(Utc::now());
                last.outcome = Some(outcome);
                last.error = error;
            }
        }
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// Whether the task succeeded on an agent other than the one it was
    /// assigned, derived from the attempt history.
    pub fn succeeded_via_fallback(&self, spec: &TaskSpec) -> bool {
        self.status == TaskStatus::Succeeded
            && self
                .attempts
                .iter()
                .rev()
                .find(|a| a.outcome == Some(AttemptOutcome::Succeeded))
                .map(|a| a.agent != spec.agent)
                .unwrap_or(false)
    }
}

/// Overall status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// At least one task is not terminal.
    Running,
    /// Every task succeeded.
    Succeeded,
    /// At least one task permanently failed.
    Failed,
    /// No permanent failure, but some tasks were skipped (for example by
    /// an approval rejection).
    PartiallySkipped,
    /// The plan was canceled before finishing.
    Cancelled,
}

impl PlanStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, PlanStatus::Running)
    }

    pub fn classify(statuses: impl IntoIterator<Item = TaskStatus>, cancelled: bool) -> Self {
        let mut all_succeeded = true;
        let mut any_failed = false;
        for status in statuses {
            if !status.is_terminal() {
                return PlanStatus::Running;
            }
            if status != TaskStatus::Succeeded {
                all_succeeded = false;
            }
            if status == TaskStatus::PermanentlyFailed {
                any_failed = true;
            }
        }
        if any_failed {
            PlanStatus::Failed
        } else if all_succeeded {
            PlanStatus::Succeeded
        } else if cancelled {
            PlanStatus::Cancelled
        } else {
            PlanStatus::PartiallySkipped
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Running => "running",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::PartiallySkipped => "partially_skipped",
            PlanStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Arena of per-task execution state for one plan.
pub struct ExecutionStore {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    slots: Vec<RwLock<TaskExecutionState>>,
}

impl ExecutionStore {
    pub fn new(plan: &ValidatedPlan) -> Self {
        let ids: Vec<TaskId> = plan.tasks().iter().map(|t| t.task_id.clone()).collect();
        let index = ids.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
        let slots = plan
            .tasks()
            .iter()
            .map(|t| RwLock::new(TaskExecutionState::new(t)))
            .collect();
        Self { ids, index, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn task_id(&self, index: usize) -> &TaskId {
        &self.ids[index]
    }

    pub fn status(&self, index: usize) -> TaskStatus {
        self.slots[index].read().status
    }

    /// Clone out the state of one task.
    pub fn get(&self, index: usize) -> TaskExecutionState {
        self.slots[index].read().clone()
    }

    /// Run `f` with exclusive access to one task's state.
    pub fn update<R>(&self, index: usize, f: impl FnOnce(&mut TaskExecutionState) -> R) -> R {
        let mut slot = self.slots[index].write();
        f(&mut slot)
    }

    /// Clone out every task's state in plan order.
    pub fn snapshot(&self) -> Vec<(TaskId, TaskExecutionState)> {
        self.ids
            .iter()
            .cloned()
            .zip(self.slots.iter().map(|s| s.read().clone()))
            .collect()
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.slots.iter().map(|s| s.read().status).collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.slots.iter().all(|s| s.read().is_terminal())
    }

    pub fn plan_status(&self, cancelled: bool) -> PlanStatus {
        PlanStatus::classify(self.statuses(), cancelled)
    }
}

impl std::fmt::Debug for ExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStore")
            .field("tasks", &self.len())
            .finish()
    }
}
