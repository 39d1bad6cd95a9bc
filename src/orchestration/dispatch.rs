//! Agent dispatch port.
//!
//! The orchestrator does not prescribe a transport. Implementations of
//! [`AgentDispatcher`] deliver a task assignment to an agent by whatever
//! means they like (files, queues, RPC) and resolve once the agent reports
//! back. Transport failures are reported in-band as
//! [`DispatchResult::Error`] so they flow through retry and fallback like
//! any agent-reported failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::plan::{AgentId, TaskId};

/// A task assignment sent to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub plan_id: String,
    pub task_id: TaskId,
    pub agent: AgentId,
    pub task_type: String,
    pub content: serde_json::Value,
    /// Deadline the scheduler enforces; passed along so transports can
    /// forward it to the agent.
    pub timeout: Option<Duration>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What an agent reported for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default)]
        message: String,
    },
}

impl DispatchResult {
    pub fn success() -> Self {
        Self::Success {
            score: None,
            output: None,
        }
    }

    pub fn with_score(score: f64) -> Self {
        Self::Success {
            score: Some(score),
            output: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_code: None,
            message: message.into(),
        }
    }

    pub fn error_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error_code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Port through which the scheduler hands tasks to agents.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Send the assignment and resolve with the agent's result.
    ///
    /// The scheduler enforces `request.timeout` on its own; an
    /// implementation may resolve late, in which case the result is
    /// discarded.
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult;

    /// Best-effort request to stop an in-flight task. The scheduler does not
    /// wait for acknowledgement.
    async fn cancel(&self, _plan_id: &str, _task_id: &TaskId, _agent: &AgentId) {}
}
