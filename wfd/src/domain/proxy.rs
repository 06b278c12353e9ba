//! `TaskProxy`: the central live entity, its state machine, and its
//! prerequisite/output bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wfstore::{IndexValue, Record};

/// The proxy state machine named in the job lifecycle design. No other
/// transitions than [`TaskState::can_transition_to`] are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Waiting,
    Queued,
    Ready,
    Submitted,
    SubmitFailed,
    SubmitRetrying,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Expired,
    Runahead,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Expired)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Ready
                | TaskState::Submitted
                | TaskState::Running
                | TaskState::SubmitRetrying
                | TaskState::Retrying
        )
    }

    /// `true` if the job lifecycle state machine allows `self -> to`.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Runahead, Waiting)
                | (Waiting, Queued)
                | (Waiting, Runahead)
                | (Queued, Ready)
                | (Ready, Submitted)
                | (Submitted, Running)
                | (Submitted, SubmitFailed)
                | (SubmitFailed, SubmitRetrying)
                | (SubmitRetrying, Ready)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Retrying, Waiting)
                | (Waiting, Expired)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Waiting => "waiting",
            TaskState::Queued => "queued",
            TaskState::Ready => "ready",
            TaskState::Submitted => "submitted",
            TaskState::SubmitFailed => "submit-failed",
            TaskState::SubmitRetrying => "submit-retrying",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Expired => "expired",
            TaskState::Runahead => "runahead",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("illegal transition {from} -> {to} for {namespace}/{cycle}")]
    IllegalTransition { namespace: String, cycle: String, from: TaskState, to: TaskState },
}

/// One `(upstream_name, upstream_cycle, required_output)` triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrereqTriple {
    pub upstream_name: String,
    pub upstream_cycle: String,
    pub output: String,
    pub satisfied: bool,
}

impl PrereqTriple {
    pub fn new(upstream_name: impl Into<String>, upstream_cycle: impl Into<String>, output: impl Into<String>) -> Self {
        Self { upstream_name: upstream_name.into(), upstream_cycle: upstream_cycle.into(), output: output.into(), satisfied: false }
    }

    fn matches(&self, upstream_name: &str, upstream_cycle: &str, output: &str) -> bool {
        self.upstream_name == upstream_name && self.upstream_cycle == upstream_cycle && self.output == output
    }
}

/// A disjunction of triples (`A | B`): satisfied when any member is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrereqGroup(pub Vec<PrereqTriple>);

impl PrereqGroup {
    pub fn is_satisfied(&self) -> bool {
        self.0.iter().any(|t| t.satisfied)
    }
}

/// The full conjunction-of-disjunctions prerequisite structure (`A | B &
/// C` forms).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Prerequisites(pub Vec<PrereqGroup>);

impl Prerequisites {
    pub fn is_satisfied(&self) -> bool {
        self.0.iter().all(|g| g.is_satisfied())
    }

    /// Mark every matching triple satisfied. Returns `true` if the
    /// overall prerequisite structure is now fully satisfied (becomes
    /// the pool's cue to admit the proxy).
    pub fn mark_satisfied(&mut self, upstream_name: &str, upstream_cycle: &str, output: &str) -> bool {
        for group in &mut self.0 {
            for triple in &mut group.0 {
                if triple.matches(upstream_name, upstream_cycle, output) {
                    triple.satisfied = true;
                }
            }
        }
        self.is_satisfied()
    }

    pub fn unmet(&self) -> Vec<&PrereqTriple> {
        self.0
            .iter()
            .filter(|g| !g.is_satisfied())
            .flat_map(|g| g.0.iter())
            .collect()
    }
}

pub const OUTPUT_SUBMITTED: &str = "submitted";
pub const OUTPUT_STARTED: &str = "started";
pub const OUTPUT_SUCCEEDED: &str = "succeeded";
pub const OUTPUT_FAILED: &str = "failed";
pub const OUTPUT_SUBMIT_FAILED: &str = "submit-failed";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputState {
    pub satisfied: bool,
    pub emitted: bool,
}

/// The set of declared outputs (standard plus custom messages), each
/// with a satisfied/emitted flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Outputs(pub std::collections::BTreeMap<String, OutputState>);

impl Outputs {
    pub fn standard() -> Self {
        let mut map = std::collections::BTreeMap::new();
        for name in [OUTPUT_SUBMITTED, OUTPUT_STARTED, OUTPUT_SUCCEEDED, OUTPUT_FAILED, OUTPUT_SUBMIT_FAILED] {
            map.insert(name.to_string(), OutputState::default());
        }
        Self(map)
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        self.0.entry(name.into()).or_default();
    }

    /// Mark `name` satisfied and emitted; returns `false` if this
    /// `(name)` was already emitted (caller uses this for message
    /// idempotence at the `(proxy, submit_number, message)` level).
    pub fn emit(&mut self, name: &str) -> bool {
        let entry = self.0.entry(name.to_string()).or_default();
        let first_time = !entry.emitted;
        entry.satisfied = true;
        entry.emitted = true;
        first_time
    }
}

/// Absolute wall-clock deadlines driving the lifecycle manager's polling
/// and retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Timers {
    pub submission_timeout: Option<DateTime<Utc>>,
    pub execution_timeout: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub poll_after: Option<DateTime<Utc>>,
}

/// The central live entity: a namespace instance at a specific cycle
/// point with a specific submit number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProxy {
    /// `namespace/cycle_point`, fixed at construction time; stable
    /// across submit attempts since the same live proxy persists across
    /// retries.
    pub id: String,
    pub namespace: String,
    pub cycle_point: String,
    pub submit_number: u32,
    pub state: TaskState,
    pub is_held: bool,
    pub prerequisites: Prerequisites,
    pub outputs: Outputs,
    pub try_number: u32,
    pub submit_try_number: u32,
    pub runner_id: Option<String>,
    pub timers: Timers,
    pub host_account: Option<(String, String)>,
    pub updated_at: i64,
}

impl TaskProxy {
    pub fn new(namespace: impl Into<String>, cycle_point: impl Into<String>, updated_at: i64) -> Self {
        let namespace = namespace.into();
        let cycle_point = cycle_point.into();
        let id = proxy_key(&namespace, &cycle_point);
        Self {
            id,
            namespace,
            cycle_point,
            submit_number: 0,
            state: TaskState::Waiting,
            is_held: false,
            prerequisites: Prerequisites::default(),
            outputs: Outputs::standard(),
            try_number: 0,
            submit_try_number: 0,
            runner_id: None,
            timers: Timers::default(),
            host_account: None,
            updated_at,
        }
    }

    pub fn identity(&self) -> (String, String, u32) {
        (self.namespace.clone(), self.cycle_point.clone(), self.submit_number)
    }

    /// Apply `to` if legal, recording the new `updated_at`. On a
    /// self-retry (`Failed -> Retrying -> Waiting`), `submit_number`
    /// increments only when leaving `Retrying` back into admission
    /// (`Waiting -> Queued`), matching "submit_number increments" on
    /// retry re-admission, not on the `failed -> retrying` edge itself.
    pub fn transition(&mut self, to: TaskState, now: i64) -> Result<(), ProxyError> {
        if !self.state.can_transition_to(to) {
            return Err(ProxyError::IllegalTransition {
                namespace: self.namespace.clone(),
                cycle: self.cycle_point.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_submit(&mut self, now: i64) {
        self.submit_number += 1;
        self.updated_at = now;
    }
}

impl Record for TaskProxy {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "task_pool"
    }

    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("namespace", IndexValue::Text(self.namespace.clone())),
            ("cycle_point", IndexValue::Text(self.cycle_point.clone())),
            ("state", IndexValue::Text(self.state.to_string())),
        ]
    }
}

/// The stable `collection` id a proxy is stored under: `namespace/cycle`.
/// `submit_number` is excluded because the same live proxy persists
/// across submit attempts.
pub fn proxy_key(namespace: &str, cycle_point: &str) -> String {
    format!("{namespace}/{cycle_point}")
}
