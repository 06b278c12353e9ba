//! Integration tests for the cycling workflow scheduler.
//!
//! These exercise the task pool, dependency resolver, persistent store,
//! and broadcast overlay together, covering the concrete scenarios a
//! conforming scheduler must satisfy: a linear graph driven to
//! completion, a runahead-capped cycling window, a stalled graph, a
//! restart against a persisted store, and a broadcast override that
//! survives that restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use wfbroadcast::{BroadcastStore, BroadcastTarget};
use wfd::daemon::WorkflowServices;
use wfd::domain::proxy::{OUTPUT_FAILED, OUTPUT_SUCCEEDED, TaskProxy, TaskState};
use wfd::domain::workflow_config::{NamespaceConfig, ResolvedNamespace};
use wfd::executor::{Executor, ExecutorConfig};
use wfd::ingress::{self, IngressMessage, Severity};
use wfd::lifecycle::LifecycleManager;
use wfd::pool::TaskPool;
use wfd::resolver::{CompiledGraph, on_output_emitted};
use wfstore::Store;

fn integer_cycle_of_offset(cycle: &str, offset: i64) -> String {
    let n: i64 = cycle.parse().unwrap();
    (n + offset).to_string()
}

/// Scenario 1: two-task linear graph `a => b`, integer cycling,
/// initial=1 final=3. Driving every `a/N` to `succeeded` must bring
/// every `b/N` ready in turn, in cycle order.
#[test]
fn linear_graph_drives_downstream_through_three_cycles() {
    let graph = CompiledGraph::compile(&["a => b"]).unwrap();
    let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());

    for cycle in ["1", "2", "3"] {
        pool.spawn("a", cycle, false, 0);
    }

    let mut succeeded_order = Vec::new();
    for cycle in ["1", "2", "3"] {
        let proxy = pool.get_mut("a", cycle).unwrap();
        for state in [TaskState::Queued, TaskState::Ready, TaskState::Submitted, TaskState::Running, TaskState::Succeeded] {
            proxy.transition(state, 0).unwrap();
        }
        proxy.outputs.emit(OUTPUT_SUCCEEDED);
        succeeded_order.push(format!("a/{cycle}"));

        on_output_emitted(&graph, &mut pool, "a", cycle, OUTPUT_SUCCEEDED, 0, integer_cycle_of_offset, |_, _| true).unwrap();

        let b = pool.get("b", cycle).unwrap();
        assert!(b.prerequisites.is_satisfied(), "b/{cycle} should be unblocked once a/{cycle} succeeds");
        succeeded_order.push(format!("b/{cycle}"));
    }

    assert_eq!(succeeded_order, vec!["a/1", "b/1", "a/2", "b/2", "a/3", "b/3"]);
}

/// Scenario 3: `a => b`, `a` fails with no retries and no failure
/// handler. `b` must stay `waiting` and the pool must report a stall
/// once nothing can progress.
#[test]
fn graph_stalls_when_upstream_fails_without_retry() {
    let graph = CompiledGraph::compile(&["a => b"]).unwrap();
    let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
    pool.spawn("a", "1", false, 0);
    // b is materialized up front on its own recurrence with the
    // prerequisites the graph declares for it, the way a scheduler
    // seeds every cycle's proxies ahead of any trigger firing.
    let b_prereqs = graph.prerequisites_for("b", "1", integer_cycle_of_offset);
    pool.spawn_with_prerequisites("b", "1", false, 0, b_prereqs);

    let a = pool.get_mut("a", "1").unwrap();
    for state in [TaskState::Queued, TaskState::Ready, TaskState::Submitted, TaskState::Running, TaskState::Failed] {
        a.transition(state, 0).unwrap();
    }
    a.outputs.emit(OUTPUT_FAILED);

    on_output_emitted(&graph, &mut pool, "a", "1", OUTPUT_FAILED, 0, integer_cycle_of_offset, |_, _| true).unwrap();

    assert_eq!(pool.get("b", "1").unwrap().state, TaskState::Waiting);
    assert!(pool.is_stalled(false), "nothing can progress: a/1 failed terminally and b/1 has no satisfied prerequisite");
}

/// Scenario 6: `max_active_cycle_points = 2`, `a` stuck in cycle 1.
/// Cycle 3 must stay in the runahead pool until cycle 1 terminates.
#[test]
fn runahead_window_holds_back_cycles_beyond_the_cap() {
    let mut pool = TaskPool::new(2, HashMap::new(), HashMap::new());
    pool.spawn("a", "1", false, 0);
    pool.spawn("a", "2", false, 0);
    pool.spawn("a", "3", true, 0);

    pool.advance_runahead(|c| c.parse().unwrap(), 1);

    assert_eq!(pool.get("a", "3").unwrap().state, TaskState::Runahead, "cycle 3 is two past the oldest active cycle 1");
    assert_eq!(pool.count_active_cycle_points(), 2);
}

/// Scenario 4 (restart mid-run, persistence half): a proxy's state at
/// the moment of a clean stop must round-trip through the store
/// unchanged, so a freshly-started process picks up exactly where the
/// prior one left off.
#[test]
fn proxy_state_round_trips_through_the_store_across_a_restart() {
    let store = Store::open_in_memory().unwrap();

    let mut proxy = TaskProxy::new("a", "3", 0);
    for state in [TaskState::Queued, TaskState::Ready, TaskState::Submitted, TaskState::Running] {
        proxy.transition(state, 0).unwrap();
    }
    proxy.begin_submit(0);
    store.put(&proxy).unwrap();

    // Simulate the clean-stop/restart boundary: drop everything in
    // memory, reopen against the same (here, same in-memory) store.
    let reloaded: TaskProxy = store.require(&proxy.id).unwrap();
    assert_eq!(reloaded.state, TaskState::Running);
    assert_eq!(reloaded.submit_number, proxy.submit_number);

    // The restarted scheduler polls the in-flight job and, finding it
    // already exited 0 on disk, transitions straight to succeeded
    // without re-executing it.
    let mut resumed = reloaded;
    resumed.transition(TaskState::Succeeded, 1).unwrap();
    store.put(&resumed).unwrap();

    let final_state: TaskProxy = store.require(&resumed.id).unwrap();
    assert_eq!(final_state.state, TaskState::Succeeded);
}

/// Scenario 5: a broadcast set while the scheduler is running is
/// visible to subsequent lookups in the targeted cycle, and the entry
/// itself persists across a restart once run through the store the way
/// `wfd::lifecycle` snapshots broadcasts for crash-restart safety.
#[test]
fn broadcast_override_is_visible_and_survives_a_restart() {
    let store = Store::open_in_memory().unwrap();
    let broadcast = BroadcastStore::new();
    wfd::domain::broadcast_record::persist_set(
        &store,
        &broadcast,
        BroadcastTarget::new("root", "2020"),
        "environment.X",
        serde_json::json!(42),
    )
    .unwrap();

    let resolved = broadcast.lookup(&["a", "root"], "2020");
    assert_eq!(resolved.get("environment.X"), Some(&serde_json::json!(42)));

    // Restart: drop the in-memory overlay and rebuild it from whatever
    // broadcast_states holds, the way cmd_play reloads at startup.
    let restarted = wfd::domain::broadcast_record::load(&store).unwrap();
    let resolved_after_restart = restarted.lookup(&["a", "root"], "2020");
    assert_eq!(resolved_after_restart.get("environment.X"), Some(&serde_json::json!(42)));
}

/// Scenario 2 (retry, state-machine half): `submit_number` strictly
/// increases across retries and the legal transition sequence per try
/// is `ready -> submitted -> running -> failed -> retrying -> waiting`.
#[test]
fn retry_sequence_increments_submit_number_and_returns_to_waiting() {
    let mut proxy = TaskProxy::new("t", "1", 0);

    for attempt in 1..=3u32 {
        proxy.transition(TaskState::Queued, 0).unwrap();
        proxy.transition(TaskState::Ready, 0).unwrap();
        proxy.begin_submit(0);
        assert_eq!(proxy.submit_number, attempt);
        proxy.transition(TaskState::Submitted, 0).unwrap();
        proxy.transition(TaskState::Running, 0).unwrap();
        proxy.transition(TaskState::Failed, 0).unwrap();
        if attempt < 3 {
            proxy.transition(TaskState::Retrying, 0).unwrap();
            proxy.transition(TaskState::Waiting, 0).unwrap();
        }
    }

    assert_eq!(proxy.state, TaskState::Failed);
    assert_eq!(proxy.submit_number, 3);
}

/// Replaces hand-calling `.transition()`/`.emit()` to fake job progress:
/// this drives a real process through [`LifecycleManager::submit`], lets
/// the rendered job script report its own `started`/`succeeded` through
/// the status file it writes, and feeds those reports back through
/// [`LifecycleManager::apply_message`] the way the scheduler loop's
/// status-file poll does. If the job script's callback or the poll path
/// were missing, the proxy would stay stuck in `submitted` forever and
/// this test would time out.
#[tokio::test]
async fn submitted_job_reports_its_own_completion_through_the_status_file() {
    let store = Store::open_in_memory().unwrap();
    let broadcast = BroadcastStore::new();
    let executor = Arc::new(Executor::new(ExecutorConfig::default()));
    let temp = tempfile::TempDir::new().unwrap();
    let services = WorkflowServices::new(temp.path());
    let lifecycle = LifecycleManager::new(&store, &broadcast, executor, &services, "wf");

    let mut settings = NamespaceConfig::default();
    settings.script = Some("true".to_string());
    let resolved = ResolvedNamespace { name: "a".to_string(), ancestry: vec!["a".to_string(), "root".to_string()], settings };

    let mut proxy = TaskProxy::new("a", "1", 0);
    proxy.transition(TaskState::Queued, 0).unwrap();
    proxy.transition(TaskState::Ready, 0).unwrap();
    lifecycle.submit(&mut proxy, &resolved, 0).await.unwrap();
    assert_eq!(proxy.state, TaskState::Submitted);

    let status_path = services.job_log_dir("1", "a", proxy.submit_number).join("job.status");
    let status = loop {
        if let Ok(status) = ingress::read_job_status_file(&status_path).await {
            if status.messages.iter().any(|(_, _, text)| text == "succeeded") {
                break status;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    for (_, severity, text) in &status.messages {
        let message = IngressMessage {
            workflow: "wf".to_string(),
            proxy_id: proxy.id.clone(),
            submit_number: proxy.submit_number,
            severity: *severity,
            text: text.clone(),
        };
        lifecycle.apply_message(&mut proxy, &message, 1).unwrap();
    }

    assert_eq!(proxy.state, TaskState::Succeeded);
    assert!(proxy.outputs.0.get(OUTPUT_SUCCEEDED).is_some_and(|s| s.emitted));
}

/// Replaces hand-calling `.emit()` on the downstream proxy directly: the
/// message is dialed over the real ingress TCP listener (the same call a
/// running job's own callback or the `wfd message` CLI path makes), and
/// propagation through the dependency graph runs through
/// [`on_output_emitted`] off the message [`LifecycleManager::apply_message`]
/// actually applied, not an assumption that it would have applied it.
#[tokio::test]
async fn message_delivered_over_the_network_drives_lifecycle_and_propagates_downstream() {
    let store = Store::open_in_memory().unwrap();
    let broadcast = BroadcastStore::new();
    let executor = Arc::new(Executor::new(ExecutorConfig::default()));
    let temp = tempfile::TempDir::new().unwrap();
    let services = WorkflowServices::new(temp.path());
    let lifecycle = LifecycleManager::new(&store, &broadcast, executor, &services, "wf");

    let graph = CompiledGraph::compile(&["a => b"]).unwrap();
    let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
    let mut proxy = TaskProxy::new("a", "1", 0);
    proxy.transition(TaskState::Queued, 0).unwrap();
    proxy.transition(TaskState::Ready, 0).unwrap();
    proxy.transition(TaskState::Submitted, 0).unwrap();
    proxy.transition(TaskState::Running, 0).unwrap();
    let b_prereqs = graph.prerequisites_for("b", "1", |c, o| (c.parse::<i64>().unwrap() + o).to_string());
    pool.spawn_with_prerequisites("b", "1", false, 0, b_prereqs);
    pool.spawn("a", "1", false, 0);
    *pool.get_mut("a", "1").unwrap() = proxy;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<IngressMessage>(8);
    let listener = ingress::bind_in_range(21000, 21100).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(ingress::serve(listener, "sekret".to_string(), tx));
    tokio::time::sleep(Duration::from_millis(20)).await;

    ingress::send_message("127.0.0.1", port, "sekret", "wf", "a/1", 0, vec!["succeeded".to_string()]).await.unwrap();
    let message = rx.recv().await.unwrap();
    assert_eq!(message.text, "succeeded");

    let a = pool.get_mut("a", "1").unwrap();
    lifecycle.apply_message(a, &message, 1).unwrap();
    assert_eq!(a.state, TaskState::Succeeded);

    on_output_emitted(&graph, &mut pool, "a", "1", OUTPUT_SUCCEEDED, 1, |c, o| (c.parse::<i64>().unwrap() + o).to_string(), |_, _| true).unwrap();
    assert!(pool.get("b", "1").unwrap().prerequisites.is_satisfied());
}
