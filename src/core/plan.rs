//! Plan data model.
//!
//! A plan is a versioned, owned collection of task definitions. Task
//! definitions are immutable once the plan is accepted; all mutable
//! execution data lives in [`crate::core::execution`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identifier of a task, unique within its plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static definition of a single task in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Identifier, unique within the plan.
    pub task_id: TaskId,
    /// Agent the task is assigned to.
    pub agent: AgentId,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Opaque payload handed to the agent.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Tasks that must succeed before this one may run.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Retries allowed on the primary agent.
    #[serde(default)]
    pub max_retries: u32,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub approval_required: bool,
    /// Agent escalated to once retries on `agent` are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<AgentId>,
}

impl TaskSpec {
    /// Create a task with defaults for every optional field.
    pub fn new(task_id: impl Into<TaskId>, agent: impl Into<AgentId>) -> Self {
        Self {
            task_id: task_id.into(),
            agent: agent.into(),
            task_type: String::new(),
            description: String::new(),
            content: serde_json::Value::Null,
            dependencies: Vec::new(),
            max_retries: 0,
            timeout_secs: None,
            approval_required: false,
            fallback_agent: None,
        }
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_fallback(mut self, agent: impl Into<AgentId>) -> Self {
        self.fallback_agent = Some(agent.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Why `id` cannot name a plan, if it cannot.
///
/// Plan ids double as snapshot file names, so they must stay a single
/// path component.
pub fn plan_id_problem(id: &str) -> Option<&'static str> {
    if id.trim().is_empty() {
        Some("must not be empty")
    } else if id.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else if id.contains("..") {
        Some("must not contain '..'")
    } else {
        None
    }
}

/// A submitted plan: a named, versioned collection of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn new(plan_id: &str) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            version: "1".to_string(),
            owner: String::new(),
            created_at: Utc::now(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.task_id == id)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a plan document, choosing the format by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("toml") => Self::from_toml_str(&raw),
            other => Err(Error::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}
