//! Workflow configuration file loading: the `[scheduler]`/`[scheduling]`/
//! `[runtime]` YAML document with a fallback search chain.
//!
//! Grounded directly on `src/config.rs`'s `Config::load`/`load_from_file`
//! fallback-chain pattern (explicit path, then project-local, then user
//! config dir, then defaults), generalized to a required workflow
//! source file rather than an optional tool config.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};

use crate::domain::workflow_config::{ConfigError, NamespaceResolver, ResolvedNamespace, WorkflowConfig};

/// Loads a workflow's `flow.yaml`, searching an explicit path first,
/// then `./flow.yaml` in the current directory, then
/// `~/.config/wfd/<name>/flow.yaml`.
pub fn load(explicit_path: Option<&Path>, workflow_name: &str) -> Result<WorkflowConfig> {
    if let Some(path) = explicit_path {
        return load_from_file(path).context(format!("failed to load workflow config from {}", path.display()));
    }

    let local = PathBuf::from("flow.yaml");
    if local.exists() {
        match load_from_file(&local) {
            Ok(config) => return Ok(config),
            Err(e) => tracing::warn!(path = %local.display(), error = %e, "failed to load local flow.yaml"),
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("wfd").join(workflow_name).join("flow.yaml");
        if user_config.exists() {
            return load_from_file(&user_config).context(format!("failed to load workflow config from {}", user_config.display()));
        }
    }

    Err(eyre::eyre!("no flow.yaml found for workflow {workflow_name:?}"))
}

fn load_from_file(path: &Path) -> Result<WorkflowConfig> {
    let content = fs::read_to_string(path).context("failed to read workflow config file")?;
    let config: WorkflowConfig = serde_yaml::from_str(&content).context("failed to parse workflow config file")?;
    tracing::info!(path = %path.display(), "loaded workflow config");
    Ok(config)
}

/// Full validation: every namespace's inheritance resolves, every
/// prerequisite's offset cycle sits on its own recurrence (checked by
/// the caller once the resolver is compiled), and cycling modes aren't
/// mixed between calendar and integer recurrences.
pub fn validate(config: &WorkflowConfig) -> std::result::Result<Vec<ResolvedNamespace>, ConfigError> {
    let resolver = NamespaceResolver::new(&config.runtime);
    let resolved = resolver.resolve_all()?;

    let mixed = config.scheduling.dependencies.iter().any(|dep| {
        let is_integer = dep.recurrence.starts_with('P') && dep.recurrence.chars().nth(1).is_some_and(|c| c.is_ascii_digit());
        is_integer != (config.scheduling.cycling_mode == crate::domain::workflow_config::CyclingMode::Integer)
    });
    if mixed {
        return Err(ConfigError::MixedCalendars(
            "recurrence syntax does not match the declared cycling mode".to_string(),
        ));
    }

    Ok(resolved.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn validate_resolves_namespaces_with_no_dependencies() {
        let config = WorkflowConfig { runtime: HashMap::new(), ..Default::default() };
        let resolved = validate(&config).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn load_from_explicit_path_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("flow.yaml");
        fs::write(&path, "scheduler: {}\nscheduling: {}\nruntime: {}\n").unwrap();
        let config = load(Some(&path), "demo").unwrap();
        assert!(config.runtime.is_empty());
    }
}
