//! `WorkflowConfig`: the validated, immutable input value the rest of
//! the scheduler is built from, and the namespace-inheritance resolver
//! that freezes it into per-namespace settings ahead of time.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("namespace {0:?} inherits from itself through {1:?}")]
    InheritanceCycle(String, Vec<String>),
    #[error("namespace {0:?} inherits from unknown namespace {1:?}")]
    UnknownParent(String, String),
    #[error("prerequisite on {namespace:?} references a cycle not on its own recurrence")]
    PrerequisiteOffRecurrence { namespace: String },
    #[error("mixed calendars: {0}")]
    MixedCalendars(String),
    #[error("ambiguous precedence between a broadcast target and a parameter-environment template for key {0:?} on namespace {1:?}")]
    AmbiguousKeyPrecedence(String, String),
}

/// `[scheduling] cycling mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CyclingMode {
    #[default]
    Gregorian,
    Days360,
    Days365,
    Days366,
    Integer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceGraph {
    pub recurrence: String,
    /// A graph string of the form `upstream[offset]:output => downstream`,
    /// one edge per line once split.
    pub graph: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSection {
    pub initial_cycle_point: String,
    pub final_cycle_point: Option<String>,
    pub cycling_mode: CyclingMode,
    pub runahead_limit: String,
    pub max_active_cycle_points: u32,
    pub spawn_to_max_active_cycle_points: bool,
    pub queues: HashMap<String, QueueConfig>,
    pub special_tasks: SpecialTasksConfig,
    pub dependencies: Vec<RecurrenceGraph>,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            initial_cycle_point: String::new(),
            final_cycle_point: None,
            cycling_mode: CyclingMode::default(),
            runahead_limit: "P0".to_string(),
            max_active_cycle_points: 3,
            spawn_to_max_active_cycle_points: false,
            queues: HashMap::new(),
            special_tasks: SpecialTasksConfig::default(),
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    pub limit: u32,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpecialTasksConfig {
    pub clock_trigger: Vec<String>,
    pub clock_expire: Vec<String>,
    pub external_trigger: Vec<String>,
    pub sequential: Vec<String>,
    pub include_at_startup: Vec<String>,
    pub exclude_at_startup: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub handlers: HashMap<String, Vec<String>>,
    pub mail_events: Vec<String>,
    pub mail_batch_interval: String,
    pub abort_on_stall_timeout: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            mail_events: Vec::new(),
            mail_batch_interval: "PT5M".to_string(),
            abort_on_stall_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub shared_secret_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub utc_mode: bool,
    pub cycle_point_format: Option<String>,
    pub cycle_point_num_expanded_year_digits: u32,
    pub health_check_interval: String,
    pub events: EventsConfig,
    pub authentication: AuthConfig,
    pub parameters: HashMap<String, Vec<String>>,
    pub simulation_mode: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            utc_mode: true,
            cycle_point_format: None,
            cycle_point_num_expanded_year_digits: 0,
            health_check_interval: "PT10M".to_string(),
            events: EventsConfig::default(),
            authentication: AuthConfig::default(),
            parameters: HashMap::new(),
            simulation_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JobConfig {
    pub runner: String,
    pub execution_time_limit: Option<String>,
    pub submission_retry_delays: Vec<String>,
    pub execution_retry_delays: Vec<String>,
    pub submission_polling_intervals: Vec<String>,
    pub execution_polling_intervals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: Option<String>,
    pub owner: Option<String>,
    pub retrieve_job_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NamespaceEventsConfig {
    pub handlers: HashMap<String, Vec<String>>,
    pub mail_events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EnvironmentFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SuiteStatePollingConfig {
    pub workflow: Option<String>,
    pub task: Option<String>,
    pub status: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimulationConfig {
    pub default_run_length: Option<String>,
    pub speedup_factor: Option<f64>,
    pub fail_cycle_points: Vec<String>,
}

/// `[runtime]` per-namespace settings, before inheritance is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NamespaceConfig {
    pub inherit: Vec<String>,
    pub init_script: Option<String>,
    pub env_script: Option<String>,
    pub pre_script: Option<String>,
    pub script: Option<String>,
    pub post_script: Option<String>,
    pub err_script: Option<String>,
    pub exit_script: Option<String>,
    pub work_sub_directory: Option<String>,
    pub meta: HashMap<String, String>,
    pub job: JobConfig,
    pub remote: RemoteConfig,
    pub events: NamespaceEventsConfig,
    pub environment: HashMap<String, String>,
    pub environment_filter: EnvironmentFilter,
    pub parameter_environment_templates: HashMap<String, String>,
    pub directives: HashMap<String, String>,
    pub outputs: HashMap<String, String>,
    pub suite_state_polling: SuiteStatePollingConfig,
    pub simulation: SimulationConfig,
}

/// The full validated configuration for a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowConfig {
    pub scheduler: SchedulerSection,
    pub scheduling: SchedulingSection,
    pub runtime: HashMap<String, NamespaceConfig>,
}

/// A namespace's settings after inheritance has been resolved: a frozen
/// merge of `root` plus every ancestor plus the namespace itself,
/// closest-wins.
#[derive(Debug, Clone)]
pub struct ResolvedNamespace {
    pub name: String,
    /// Linearized ancestry, closest first, ending in `"root"` if
    /// present.
    pub ancestry: Vec<String>,
    pub settings: NamespaceConfig,
}

/// Compiles `[runtime]`'s `inherit` lists into a linearized merge order
/// ahead of time (C3-style: no runtime monkey-patching), the way a
/// dependency graph is validated for cycles before use.
pub struct NamespaceResolver<'a> {
    namespaces: &'a HashMap<String, NamespaceConfig>,
}

impl<'a> NamespaceResolver<'a> {
    pub fn new(namespaces: &'a HashMap<String, NamespaceConfig>) -> Self {
        Self { namespaces }
    }

    /// Resolve every declared namespace, failing fast on an inheritance
    /// cycle or a reference to an undeclared parent.
    pub fn resolve_all(&self) -> Result<HashMap<String, ResolvedNamespace>, ConfigError> {
        let mut resolved = HashMap::new();
        for name in self.namespaces.keys() {
            resolved.insert(name.clone(), self.resolve(name)?);
        }
        Ok(resolved)
    }

    pub fn resolve(&self, name: &str) -> Result<ResolvedNamespace, ConfigError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let ancestry = self.linearize(name, &mut visited, &mut path)?;

        let mut settings = NamespaceConfig::default();
        // Furthest ancestor first, so the namespace's own settings (at
        // index 0) are applied last and win.
        for ancestor in ancestry.iter().rev() {
            if let Some(cfg) = self.namespaces.get(ancestor) {
                merge_namespace(&mut settings, cfg);
            }
        }

        Ok(ResolvedNamespace { name: name.to_string(), ancestry, settings })
    }

    fn linearize(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<Vec<String>, ConfigError> {
        if path.contains(&name.to_string()) {
            let mut cycle = path.clone();
            cycle.push(name.to_string());
            return Err(ConfigError::InheritanceCycle(name.to_string(), cycle));
        }
        path.push(name.to_string());
        visited.insert(name.to_string());

        let mut ancestry = vec![name.to_string()];
        if name != "root" {
            let parents = match self.namespaces.get(name) {
                Some(cfg) if !cfg.inherit.is_empty() => cfg.inherit.clone(),
                _ => vec!["root".to_string()],
            };
            for parent in parents {
                if parent != "root" && !self.namespaces.contains_key(&parent) {
                    return Err(ConfigError::UnknownParent(name.to_string(), parent));
                }
                let parent_ancestry = self.linearize(&parent, visited, path)?;
                for item in parent_ancestry {
                    if !ancestry.contains(&item) {
                        ancestry.push(item);
                    }
                }
            }
        }

        path.pop();
        Ok(ancestry)
    }
}

fn merge_namespace(base: &mut NamespaceConfig, overlay: &NamespaceConfig) {
    if overlay.init_script.is_some() {
        base.init_script = overlay.init_script.clone();
    }
    if overlay.env_script.is_some() {
        base.env_script = overlay.env_script.clone();
    }
    if overlay.pre_script.is_some() {
        base.pre_script = overlay.pre_script.clone();
    }
    if overlay.script.is_some() {
        base.script = overlay.script.clone();
    }
    if overlay.post_script.is_some() {
        base.post_script = overlay.post_script.clone();
    }
    if overlay.err_script.is_some() {
        base.err_script = overlay.err_script.clone();
    }
    if overlay.exit_script.is_some() {
        base.exit_script = overlay.exit_script.clone();
    }
    if overlay.work_sub_directory.is_some() {
        base.work_sub_directory = overlay.work_sub_directory.clone();
    }
    base.meta.extend(overlay.meta.clone());
    if !overlay.job.runner.is_empty() {
        base.job.runner = overlay.job.runner.clone();
    }
    if overlay.job.execution_time_limit.is_some() {
        base.job.execution_time_limit = overlay.job.execution_time_limit.clone();
    }
    if !overlay.job.submission_retry_delays.is_empty() {
        base.job.submission_retry_delays = overlay.job.submission_retry_delays.clone();
    }
    if !overlay.job.execution_retry_delays.is_empty() {
        base.job.execution_retry_delays = overlay.job.execution_retry_delays.clone();
    }
    if !overlay.job.submission_polling_intervals.is_empty() {
        base.job.submission_polling_intervals = overlay.job.submission_polling_intervals.clone();
    }
    if !overlay.job.execution_polling_intervals.is_empty() {
        base.job.execution_polling_intervals = overlay.job.execution_polling_intervals.clone();
    }
    if overlay.remote.host.is_some() {
        base.remote.host = overlay.remote.host.clone();
    }
    if overlay.remote.owner.is_some() {
        base.remote.owner = overlay.remote.owner.clone();
    }
    base.remote.retrieve_job_logs = overlay.remote.retrieve_job_logs || base.remote.retrieve_job_logs;
    base.events.handlers.extend(overlay.events.handlers.clone());
    if !overlay.events.mail_events.is_empty() {
        base.events.mail_events = overlay.events.mail_events.clone();
    }
    base.environment.extend(overlay.environment.clone());
    if !overlay.environment_filter.include.is_empty() {
        base.environment_filter.include = overlay.environment_filter.include.clone();
    }
    if !overlay.environment_filter.exclude.is_empty() {
        base.environment_filter.exclude = overlay.environment_filter.exclude.clone();
    }
    base.parameter_environment_templates.extend(overlay.parameter_environment_templates.clone());
    base.directives.extend(overlay.directives.clone());
    base.outputs.extend(overlay.outputs.clone());
    if overlay.suite_state_polling.workflow.is_some() {
        base.suite_state_polling = overlay.suite_state_polling.clone();
    }
    if overlay.simulation.default_run_length.is_some() {
        base.simulation = overlay.simulation.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(namespaces: &[(&str, Vec<&str>)]) -> HashMap<String, NamespaceConfig> {
        namespaces
            .iter()
            .map(|(name, inherit)| {
                let mut cfg = NamespaceConfig::default();
                cfg.inherit = inherit.iter().map(|s| s.to_string()).collect();
                (name.to_string(), cfg)
            })
            .collect()
    }

    #[test]
    fn linearizes_single_inheritance_chain() {
        let ns = config_with(&[("task_a", vec!["family_x"]), ("family_x", vec!["root"])]);
        let resolver = NamespaceResolver::new(&ns);
        let resolved = resolver.resolve("task_a").unwrap();
        assert_eq!(resolved.ancestry, vec!["task_a", "family_x", "root"]);
    }

    #[test]
    fn defaults_to_root_with_no_inherit_declared() {
        let ns = config_with(&[("task_a", vec![])]);
        let resolver = NamespaceResolver::new(&ns);
        let resolved = resolver.resolve("task_a").unwrap();
        assert_eq!(resolved.ancestry, vec!["task_a", "root"]);
    }

    #[test]
    fn detects_inheritance_cycle() {
        let ns = config_with(&[("a", vec!["b"]), ("b", vec!["a"])]);
        let resolver = NamespaceResolver::new(&ns);
        assert!(matches!(resolver.resolve("a"), Err(ConfigError::InheritanceCycle(_, _))));
    }

    #[test]
    fn own_settings_win_over_ancestor() {
        let mut namespaces = HashMap::new();
        let mut family = NamespaceConfig::default();
        family.script = Some("family script".to_string());
        namespaces.insert("family_x".to_string(), family);

        let mut task = NamespaceConfig::default();
        task.inherit = vec!["family_x".to_string()];
        task.script = Some("task script".to_string());
        namespaces.insert("task_a".to_string(), task);

        let resolver = NamespaceResolver::new(&namespaces);
        let resolved = resolver.resolve("task_a").unwrap();
        assert_eq!(resolved.settings.script.as_deref(), Some("task script"));
    }

    #[test]
    fn unknown_parent_is_an_error() {
        let ns = config_with(&[("task_a", vec!["nonexistent"])]);
        let resolver = NamespaceResolver::new(&ns);
        assert!(matches!(resolver.resolve("task_a"), Err(ConfigError::UnknownParent(_, _))));
    }
}
