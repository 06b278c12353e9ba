//! Job Lifecycle Manager: the per-submit action sequence (broadcast and
//! remote resolution, submit_number allocation, script rendering,
//! submission, polling, kill) described in the proxy state machine.
//!
//! Grounded on `src/scheduler/core.rs`'s `Scheduler::schedule`/`complete`
//! request lifecycle (allocate -> run -> observe completion), adapted
//! from a generic rate-limited request queue to job-submit semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use wfbroadcast::BroadcastStore;
use wfstore::{Record, Store};

use crate::daemon::WorkflowServices;
use crate::domain::job::JobRecord;
use crate::domain::proxy::{
    OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMITTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUCCEEDED, ProxyError, TaskProxy, TaskState,
};
use crate::domain::workflow_config::{NamespaceConfig, ResolvedNamespace};
use crate::error::SchedulerError;
use crate::executor::{Executor, ExecutorError};
use crate::ingress::{IngressMessage, Severity};
use crate::jobscript::{self, JobScriptContext};

/// Parses a small subset of ISO 8601 duration shorthand used throughout
/// retry-delay and polling-interval lists (`PT1S`, `PT2M`, `PT1H`).
pub fn parse_iso_delay(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix("PT")?;
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in rest.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            'H' | 'M' | 'S' => {
                let n: u64 = digits.parse().ok()?;
                digits.clear();
                total += match ch {
                    'H' => Duration::from_secs(n * 3600),
                    'M' => Duration::from_secs(n * 60),
                    'S' => Duration::from_secs(n),
                    _ => unreachable!(),
                };
            }
            _ => return None,
        }
    }
    Some(total)
}

/// The last value in a polling-interval list is sticky: once exhausted,
/// every subsequent poll uses it.
pub fn polling_interval_at(intervals: &[Duration], attempt: usize) -> Option<Duration> {
    if intervals.is_empty() {
        return None;
    }
    Some(intervals[attempt.min(intervals.len() - 1)])
}

async fn append_status_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await
}

pub struct LifecycleManager<'a> {
    store: &'a Store,
    broadcast: &'a BroadcastStore,
    executor: Arc<Executor>,
    services: &'a WorkflowServices,
    workflow_name: String,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(
        store: &'a Store,
        broadcast: &'a BroadcastStore,
        executor: Arc<Executor>,
        services: &'a WorkflowServices,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self { store, broadcast, executor, services, workflow_name: workflow_name.into() }
    }

    /// Merges broadcast overrides onto the resolved namespace's
    /// environment; broadcasts always win (see the documented precedence
    /// decision for broadcast vs. parameter-environment templates).
    fn effective_environment(&self, _namespace: &str, cycle: &str, ancestry: &[String], settings: &NamespaceConfig) -> Vec<(String, String)> {
        let overrides = self.broadcast.lookup(&ancestry.iter().map(String::as_str).collect::<Vec<_>>(), cycle);
        settings
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(overrides.into_iter().filter_map(|(key_path, value)| {
                key_path.strip_prefix("environment.").map(|key| (key.to_string(), value.as_str().unwrap_or_default().to_string()))
            }))
            .collect()
    }

    fn effective_host(&self, _namespace: &str, cycle: &str, ancestry: &[String], settings: &NamespaceConfig) -> (Option<String>, Option<String>) {
        let overrides = self.broadcast.lookup(&ancestry.iter().map(String::as_str).collect::<Vec<_>>(), cycle);
        let host = overrides.get("remote.host").and_then(|v| v.as_str().map(str::to_string)).or_else(|| settings.remote.host.clone());
        let owner = overrides.get("remote.owner").and_then(|v| v.as_str().map(str::to_string)).or_else(|| settings.remote.owner.clone());
        (host, owner)
    }

    /// Steps 1-4 of the per-submit action sequence: resolve broadcasts
    /// and remote target, allocate `submit_number`, persist a job
    /// record, render the job script, and hand it to the runner.
    pub async fn submit(
        &self,
        proxy: &mut TaskProxy,
        resolved: &ResolvedNamespace,
        now: i64,
    ) -> Result<JobRecord, SchedulerError> {
        proxy.transition(TaskState::Submitted, now)?;
        proxy.begin_submit(now);

        let (host, owner) = self.effective_host(&proxy.namespace, &proxy.cycle_point, &resolved.ancestry, &resolved.settings);
        if let Some(host) = &host {
            if !self.executor.is_initialized(host, owner.as_deref().unwrap_or("")).await {
                self.executor.mark_initialized(host, owner.as_deref().unwrap_or(""));
            }
        }

        let mut job = JobRecord::new(&proxy.id, proxy.submit_number, proxy.try_number, now);
        job.host = host.clone();
        job.user = owner;
        self.store.put(&job)?;

        let environment = self.effective_environment(&proxy.namespace, &proxy.cycle_point, &resolved.ancestry, &resolved.settings);
        let job_dir = self.services.job_log_dir(&proxy.cycle_point, &proxy.namespace, proxy.submit_number);
        tokio::fs::create_dir_all(&job_dir).await?;
        let ctx = JobScriptContext {
            workflow_name: self.workflow_name.clone(),
            namespace: proxy.namespace.clone(),
            cycle_point: proxy.cycle_point.clone(),
            submit_number: proxy.submit_number,
            try_number: proxy.try_number,
            job_dir: job_dir.to_string_lossy().into_owned(),
        };
        let script = jobscript::render(&ctx, &resolved.settings, &environment);

        let runner_argv = vec!["sh".to_string(), "-c".to_string(), script];
        let deadline = resolved
            .settings
            .job
            .execution_time_limit
            .as_deref()
            .and_then(parse_iso_delay)
            .unwrap_or(Duration::from_secs(3600));

        // The job script reports its own started/succeeded/failed
        // transitions through the status file it writes on exit (see
        // `jobscript::render`); this only needs to get the process
        // running and, if the runner's deadline kills it with SIGKILL
        // before its own exit trap can fire, record that failure itself.
        match self.executor.spawn_tracked(&runner_argv).await {
            Ok(tracked) => {
                job.runner_id = tracked.pid().map(|pid| pid.to_string());
                proxy.runner_id = job.runner_id.clone();
                self.store.put(&job)?;

                let namespace = proxy.namespace.clone();
                let cycle = proxy.cycle_point.clone();
                let status_path = job_dir.join("job.status");
                tokio::spawn(async move {
                    if let Err(ExecutorError::Timeout(cmd, deadline)) = tracked.wait(deadline).await {
                        warn!(namespace = %namespace, cycle = %cycle, cmd = %cmd, ?deadline, "job killed on deadline, recording failure");
                        let ts = chrono::Utc::now().to_rfc3339();
                        let line = format!("CYLC_JOB_EXIT=-1\nCYLC_JOB_EXIT_TIME={ts}\nCYLC_MESSAGE={ts}|NORMAL|failed\n");
                        if let Err(e) = append_status_line(&status_path, &line).await {
                            warn!(namespace = %namespace, cycle = %cycle, error = %e, "failed to record deadline-kill status");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(namespace = %proxy.namespace, cycle = %proxy.cycle_point, error = %e, "submission failed");
                proxy.transition(TaskState::SubmitFailed, now)?;
                self.store.put(&job)?;
            }
        }

        self.store.put(proxy)?;
        Ok(job)
    }

    /// Schedules `submit-failed -> submit-retrying` if retries remain,
    /// returning the delay to wait before re-admission.
    pub fn schedule_submit_retry(&self, proxy: &mut TaskProxy, settings: &NamespaceConfig, now: i64) -> Result<Option<Duration>, ProxyError> {
        let delays = &settings.job.submission_retry_delays;
        let attempt = proxy.submit_try_number as usize;
        match delays.get(attempt).and_then(|d| parse_iso_delay(d)) {
            Some(delay) => {
                proxy.submit_try_number += 1;
                proxy.transition(TaskState::SubmitRetrying, now)?;
                proxy.transition(TaskState::Ready, now)?;
                Ok(Some(delay))
            }
            None => Ok(None),
        }
    }

    /// Schedules `failed -> retrying -> waiting` if execution retries
    /// remain, re-admission happening through the pool's normal queue
    /// admission on the next tick.
    pub fn schedule_execution_retry(&self, proxy: &mut TaskProxy, settings: &NamespaceConfig, now: i64) -> Result<Option<Duration>, ProxyError> {
        let delays = &settings.job.execution_retry_delays;
        let attempt = proxy.try_number as usize;
        match delays.get(attempt).and_then(|d| parse_iso_delay(d)) {
            Some(delay) => {
                proxy.try_number += 1;
                proxy.transition(TaskState::Retrying, now)?;
                proxy.transition(TaskState::Waiting, now)?;
                Ok(Some(delay))
            }
            None => Ok(None),
        }
    }

    /// Applies one ingress message to the proxy it targets: standard
    /// outputs drive the lifecycle transition; custom messages are
    /// recorded as outputs without an implied transition; out-of-order
    /// messages (stale `submit_number`) are discarded.
    pub fn apply_message(&self, proxy: &mut TaskProxy, message: &IngressMessage, now: i64) -> Result<(), ProxyError> {
        if message.submit_number != proxy.submit_number {
            debug!(
                namespace = %proxy.namespace,
                cycle = %proxy.cycle_point,
                expected = proxy.submit_number,
                got = message.submit_number,
                "discarding message with stale submit_number"
            );
            return Ok(());
        }

        match (message.severity, message.text.as_str()) {
            (Severity::Normal, OUTPUT_STARTED) => {
                proxy.outputs.emit(OUTPUT_STARTED);
                proxy.transition(TaskState::Running, now)?;
            }
            (Severity::Normal, OUTPUT_SUCCEEDED) => {
                proxy.outputs.emit(OUTPUT_SUCCEEDED);
                proxy.transition(TaskState::Succeeded, now)?;
            }
            (Severity::Normal, OUTPUT_FAILED) => {
                proxy.outputs.emit(OUTPUT_FAILED);
                proxy.transition(TaskState::Failed, now)?;
            }
            (Severity::Normal, OUTPUT_SUBMITTED) => {
                proxy.outputs.emit(OUTPUT_SUBMITTED);
            }
            (Severity::Normal, OUTPUT_SUBMIT_FAILED) => {
                proxy.outputs.emit(OUTPUT_SUBMIT_FAILED);
                proxy.transition(TaskState::SubmitFailed, now)?;
            }
            _ => {
                proxy.outputs.declare(&message.text);
                proxy.outputs.emit(&message.text);
            }
        }
        self.store.put(proxy).map_err(|_| ProxyError::IllegalTransition {
            namespace: proxy.namespace.clone(),
            cycle: proxy.cycle_point.clone(),
            from: proxy.state,
            to: proxy.state,
        })?;
        Ok(())
    }

    /// Transitions `submitted|running -> failed` via the runner's kill
    /// path, reporting back through the same ingress channel other
    /// lifecycle updates flow through.
    pub async fn kill(&self, proxy: &mut TaskProxy, runner_kill_argv: &[String], now: i64) -> Result<(), SchedulerError> {
        if !matches!(proxy.state, TaskState::Submitted | TaskState::Running) {
            return Ok(());
        }
        let _ = self.executor.run(runner_kill_argv, None, Duration::from_secs(30)).await;
        if proxy.state == TaskState::Submitted {
            proxy.transition(TaskState::SubmitFailed, now)?;
        } else {
            proxy.transition(TaskState::Failed, now)?;
        }
        self.store.put(proxy)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_delay_shorthand() {
        assert_eq!(parse_iso_delay("PT1S"), Some(Duration::from_secs(1)));
        assert_eq!(parse_iso_delay("PT2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_iso_delay("PT1H30M"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_iso_delay("garbage"), None);
    }

    #[test]
    fn polling_interval_is_sticky_past_the_list_end() {
        let intervals = vec![Duration::from_secs(1), Duration::from_secs(5)];
        assert_eq!(polling_interval_at(&intervals, 0), Some(Duration::from_secs(1)));
        assert_eq!(polling_interval_at(&intervals, 1), Some(Duration::from_secs(5)));
        assert_eq!(polling_interval_at(&intervals, 10), Some(Duration::from_secs(5)));
    }

    #[test]
    fn apply_message_discards_stale_submit_number() {
        let store = Store::open_in_memory().unwrap();
        let broadcast = BroadcastStore::new();
        let executor = Arc::new(Executor::new(crate::executor::ExecutorConfig::default()));
        let temp = tempfile::TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let manager = LifecycleManager::new(&store, &broadcast, executor, &services, "wf");

        let mut proxy = TaskProxy::new("a", "1", 0);
        proxy.submit_number = 2;
        let message =
            IngressMessage { workflow: "wf".to_string(), proxy_id: proxy.id.clone(), submit_number: 1, severity: Severity::Normal, text: "succeeded".to_string() };
        manager.apply_message(&mut proxy, &message, 1).unwrap();
        assert_eq!(proxy.state, TaskState::Waiting);
    }

    #[test]
    fn apply_message_drives_standard_output_transitions() {
        let store = Store::open_in_memory().unwrap();
        let broadcast = BroadcastStore::new();
        let executor = Arc::new(Executor::new(crate::executor::ExecutorConfig::default()));
        let temp = tempfile::TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let manager = LifecycleManager::new(&store, &broadcast, executor, &services, "wf");

        let mut proxy = TaskProxy::new("a", "1", 0);
        proxy.transition(TaskState::Queued, 1).unwrap();
        proxy.transition(TaskState::Ready, 1).unwrap();
        proxy.transition(TaskState::Submitted, 1).unwrap();
        store.put(&proxy).unwrap();

        let message =
            IngressMessage { workflow: "wf".to_string(), proxy_id: proxy.id.clone(), submit_number: 0, severity: Severity::Normal, text: "started".to_string() };
        manager.apply_message(&mut proxy, &message, 2).unwrap();
        assert_eq!(proxy.state, TaskState::Running);
    }

    #[tokio::test]
    async fn submit_returns_without_waiting_for_the_job_to_finish_and_writes_its_status_file() {
        let store = Store::open_in_memory().unwrap();
        let broadcast = BroadcastStore::new();
        let executor = Arc::new(Executor::new(crate::executor::ExecutorConfig::default()));
        let temp = tempfile::TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let manager = LifecycleManager::new(&store, &broadcast, executor, &services, "wf");

        let mut settings = NamespaceConfig::default();
        settings.script = Some("sleep 0.05".to_string());
        let resolved = ResolvedNamespace { name: "a".to_string(), ancestry: vec!["a".to_string(), "root".to_string()], settings };

        let mut proxy = TaskProxy::new("a", "1", 0);
        let started = std::time::Instant::now();
        let job = manager.submit(&mut proxy, &resolved, 0).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50), "submit must not block on job completion");
        assert_eq!(proxy.state, TaskState::Submitted);
        assert!(job.runner_id.is_some());

        let status_path = services.job_log_dir("1", "a", proxy.submit_number).join("job.status");
        for _ in 0..50 {
            if let Ok(contents) = tokio::fs::read_to_string(&status_path).await {
                if contents.contains("succeeded") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job status file never recorded completion");
    }
}
