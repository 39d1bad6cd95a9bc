use thiserror::Error;

use crate::core::plan::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Plan validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Plan already active: {0}")]
    PlanExists(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task} is not awaiting approval (status: {status})")]
    NotAwaitingApproval { task: TaskId, status: String },

    #[error("Plan {0} has already finished")]
    PlanFinished(String),

    #[error("Plan {0} is still running")]
    PlanRunning(String),
}

/// Reasons a plan is rejected at submission time.
///
/// These are fatal to plan acceptance and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plan contains no tasks")]
    EmptyPlan,

    #[error("invalid plan id {plan_id:?}: {reason}")]
    InvalidPlanId { plan_id: String, reason: &'static str },

    #[error("duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<TaskId>),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
