//! The workflow- and task-level event taxonomy and the template
//! substitution type used to expand handler command lines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowEventKind {
    Startup,
    Shutdown,
    Aborted,
    Timeout,
    Stalled,
    Inactivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEventKind {
    Submitted,
    SubmissionFailed,
    SubmissionRetry,
    SubmissionTimeout,
    Started,
    Succeeded,
    Failed,
    Retry,
    ExecutionTimeout,
    Warning,
    Critical,
    Custom,
    Late,
}

impl TaskEventKind {
    pub fn is_mail_eligible(self) -> bool {
        matches!(self, TaskEventKind::Failed | TaskEventKind::Retry | TaskEventKind::Warning | TaskEventKind::Critical)
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Workflow { kind: WorkflowEventKind, message: Option<String> },
    Task {
        kind: TaskEventKind,
        proxy_id: String,
        cycle: String,
        submit_number: u32,
        try_number: u32,
        runner_name: Option<String>,
        runner_id: Option<String>,
        message: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> String {
        match self {
            WorkflowEvent::Workflow { kind, .. } => format!("{kind:?}").to_lowercase(),
            WorkflowEvent::Task { kind, .. } => format!("{kind:?}").to_lowercase(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template field %({0})")]
    UnknownField(String),
}

/// The closed set of fields a handler command-line template may
/// reference: `%(event)s`, `%(workflow)s`, `%(uuid)s`, `%(id)s`,
/// `%(cycle)s`, `%(submit_num)s`, `%(try_num)s`, `%(runner_name)s`,
/// `%(runner_id)s`, `%(message)s`, plus `%(meta:<key>)s` for arbitrary
/// metadata. Unknown fields are a validation error at load time, never
/// a silent pass-through at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub event: String,
    pub workflow: String,
    pub uuid: String,
    pub id: String,
    pub cycle: String,
    pub submit_num: String,
    pub try_num: String,
    pub runner_name: String,
    pub runner_id: String,
    pub message: String,
    pub meta: HashMap<String, String>,
}

/// Validates `template` against the closed field set without
/// substituting, for use at configuration-load time.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    expand_fields(template, |field| known_field(field)).map(|_| ())
}

pub fn expand_template(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    expand_fields(template, |field| {
        Some(match field {
            "event" => ctx.event.clone(),
            "workflow" => ctx.workflow.clone(),
            "uuid" => ctx.uuid.clone(),
            "id" => ctx.id.clone(),
            "cycle" => ctx.cycle.clone(),
            "submit_num" => ctx.submit_num.clone(),
            "try_num" => ctx.try_num.clone(),
            "runner_name" => ctx.runner_name.clone(),
            "runner_id" => ctx.runner_id.clone(),
            "message" => ctx.message.clone(),
            other => other.strip_prefix("meta:").and_then(|key| ctx.meta.get(key)).cloned()?,
        })
    })
}

fn known_field(field: &str) -> Option<String> {
    const KNOWN: &[&str] =
        &["event", "workflow", "uuid", "id", "cycle", "submit_num", "try_num", "runner_name", "runner_id", "message"];
    if KNOWN.contains(&field) || field.starts_with("meta:") {
        Some(String::new())
    } else {
        None
    }
}

fn expand_fields(template: &str, mut resolve: impl FnMut(&str) -> Option<String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(close) = after.find(")s") else {
            out.push_str("%(");
            rest = after;
            continue;
        };
        let field = &after[..close];
        match resolve(field) {
            Some(value) => out.push_str(&value),
            None => return Err(TemplateError::UnknownField(field.to_string())),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_fields() {
        let mut ctx = TemplateContext { event: "failed".to_string(), id: "a/1".to_string(), ..Default::default() };
        ctx.meta.insert("owner".to_string(), "ops".to_string());
        let out = expand_template("%(event)s on %(id)s owned by %(meta:owner)s", &ctx).unwrap();
        assert_eq!(out, "failed on a/1 owned by ops");
    }

    #[test]
    fn rejects_unknown_field_at_validation_time() {
        assert!(validate_template("%(nonsense)s").is_err());
        assert!(validate_template("%(event)s").is_ok());
    }
}
