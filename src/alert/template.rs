//! `{{.Field}}` interpolation for alert messages and webhook bodies.
//!
//! Recognised fields: `Name`, `Type`, `Timestamp`, `TaskID`, `AgentID`,
//! `Message`, `Condition`, `TaskResult`, `Error`. The leading dot is
//! optional and whitespace inside the braces is ignored. Unknown fields are
//! left in the output untouched.

use regex::{Captures, Regex};
use std::sync::OnceLock;

use crate::alert::rule::{AlertEvent, OutcomeDetail};

const PLACEHOLDER: &str = r"\{\{\s*\.?([A-Za-z]+)\s*\}\}";

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER).ok()).as_ref()
}

/// Value of a single context field, `None` for unknown names.
pub fn field(event: &AlertEvent, name: &str) -> Option<String> {
    let value = match name {
        "Name" => event.rule_name.clone(),
        "Type" => event.event_type.to_string(),
        "Timestamp" => event.timestamp.to_rfc3339(),
        "TaskID" => event.task_id.to_string(),
        "AgentID" => event.agent_id.to_string(),
        "Message" => event.message.clone(),
        "Condition" => serde_json::to_string(&event.condition).unwrap_or_default(),
        "TaskResult" => match &event.outcome.detail {
            OutcomeDetail::TaskResult {
                score,
                output,
                duration_secs,
            } => serde_json::json!({
                "score": score,
                "output": output,
                "duration_secs": duration_secs,
            })
            .to_string(),
            OutcomeDetail::Error { .. } => String::new(),
        },
        "Error" => match &event.outcome.detail {
            OutcomeDetail::Error { error, .. } => error.to_string(),
            OutcomeDetail::TaskResult { .. } => String::new(),
        },
        _ => return None,
    };
    Some(value)
}

/// Interpolate `template` against the event's context.
pub fn render(template: &str, event: &AlertEvent) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        field(event, &caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}
