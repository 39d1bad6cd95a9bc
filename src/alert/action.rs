//! Alert Action Port and its default implementation.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::alert::rule::{AlertAction, AlertEvent};
use crate::alert::template::render;
use crate::log::LogLevel;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to deliver one alert. Logged by the engine, never retried, and
/// never reflected in task state.
#[derive(Error, Debug)]
pub enum AlertActionError {
    #[error("webhook request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("webhook {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Port through which the alert engine executes actions.
#[async_trait]
pub trait AlertActionPort: Send + Sync {
    async fn execute(&self, action: &AlertAction, alert: &AlertEvent) -> Result<(), AlertActionError>;
}

/// Executes `Log` actions through `tracing` and `Webhook` actions as HTTP POST.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    http: reqwest::Client,
}

impl ActionExecutor {
    /// Executor with a webhook client that times out after ten seconds.
    pub fn new() -> Result<Self, AlertActionError> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(AlertActionError::Client)?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn log(level: LogLevel, alert: &AlertEvent, message: &str) {
        let rule = alert.rule_name.as_str();
        let task_id = alert.task_id.as_str();
        let agent = alert.agent_id.as_str();
        match level {
            LogLevel::Error => error!(target: "baton::alert", rule, task_id, agent, "{}", message),
            LogLevel::Warn => warn!(target: "baton::alert", rule, task_id, agent, "{}", message),
            LogLevel::Info => info!(target: "baton::alert", rule, task_id, agent, "{}", message),
            LogLevel::Debug => debug!(target: "baton::alert", rule, task_id, agent, "{}", message),
            LogLevel::Trace => trace!(target: "baton::alert", rule, task_id, agent, "{}", message),
        }
    }

    /// Request body: the rendered template, or the alert itself as JSON when
    /// no template is configured.
    pub fn webhook_body(body_template: &str, alert: &AlertEvent) -> String {
        if body_template.is_empty() {
            serde_json::to_string(alert).unwrap_or_default()
        } else {
            render(body_template, alert)
        }
    }

    async fn post(
        &self,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        body: String,
    ) -> Result<(), AlertActionError> {
        let mut request = self.http.post(url);
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
        }
        for (name, value) in headers {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AlertActionError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            request = request.header(header_name, value.as_str());
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|source| AlertActionError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(AlertActionError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AlertActionPort for ActionExecutor {
    async fn execute(&self, action: &AlertAction, alert: &AlertEvent) -> Result<(), AlertActionError> {
        match action {
            AlertAction::Log {
                level,
                message_template,
            } => {
                let message = if message_template.is_empty() {
                    alert.message.clone()
                } else {
                    render(message_template, alert)
                };
                Self::log(*level, alert, &message);
                Ok(())
            }
            AlertAction::Webhook {
                url,
                headers,
                body_template,
            } => {
                let body = Self::webhook_body(body_template, alert);
                debug!(rule = %alert.rule_name, url = %url, "Posting alert webhook");
                self.post(url, headers, body).await
            }
        }
    }
}
