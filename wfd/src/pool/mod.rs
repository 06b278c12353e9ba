//! The Task Pool: the live collection of task proxies, their admission
//! to the active cycling window, and stall detection.
//!
//! Owned exclusively by the scheduler loop (see the concurrency model:
//! "only the main loop mutates pool state"), so unlike the teacher's
//! `Scheduler` this needs no internal async mutex — every method takes
//! `&mut self` and runs to completion within one tick.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::proxy::{Prerequisites, TaskProxy, TaskState, proxy_key};

pub type ProxyKey = (String, String);

fn key_of(namespace: &str, cycle: &str) -> ProxyKey {
    (namespace.to_string(), cycle.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct QueueLimit {
    pub limit: u32,
    pub running: u32,
}

/// A report line for a stalled or incomplete proxy: `"C/N is waiting
/// on [C'/N':output, ...]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteReport {
    pub namespace: String,
    pub cycle: String,
    pub unmet: Vec<String>,
}

impl std::fmt::Display for IncompleteReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} is waiting on [{}]",
            self.cycle,
            self.namespace,
            self.unmet.join(", ")
        )
    }
}

pub struct TaskPool {
    proxies: HashMap<ProxyKey, TaskProxy>,
    /// Proxies suspended above the runahead horizon, not yet in
    /// `waiting`.
    runahead: Vec<ProxyKey>,
    insertion_order: HashMap<ProxyKey, u64>,
    next_seq: u64,
    max_active_cycle_points: u32,
    /// `namespace -> queue name`, resolved from `[scheduling][[queues]]`
    /// membership at construction.
    queue_of: HashMap<String, String>,
    queues: HashMap<String, QueueLimit>,
}

impl TaskPool {
    pub fn new(max_active_cycle_points: u32, queue_of: HashMap<String, String>, queues: HashMap<String, QueueLimit>) -> Self {
        Self {
            proxies: HashMap::new(),
            runahead: Vec::new(),
            insertion_order: HashMap::new(),
            next_seq: 0,
            max_active_cycle_points,
            queue_of,
            queues,
        }
    }

    /// Idempotent: returns the existing proxy or creates one in
    /// `waiting` (or `runahead` if `above_horizon` is true), with no
    /// prerequisites (ready the moment it is admitted). Most direct
    /// callers instead go through [`Self::spawn_with_prerequisites`] so
    /// a namespace's declared dependencies actually gate it.
    pub fn spawn(&mut self, namespace: &str, cycle: &str, above_horizon: bool, now: i64) -> &mut TaskProxy {
        self.spawn_with_prerequisites(namespace, cycle, above_horizon, now, Prerequisites::default())
    }

    /// Same as [`Self::spawn`], but a proxy created for the first time
    /// starts with `prerequisites` instead of the trivially-satisfied
    /// empty set. If the proxy already existed, `prerequisites` is
    /// discarded and the existing (possibly partially satisfied) value
    /// is left untouched.
    pub fn spawn_with_prerequisites(
        &mut self,
        namespace: &str,
        cycle: &str,
        above_horizon: bool,
        now: i64,
        prerequisites: Prerequisites,
    ) -> &mut TaskProxy {
        let key = key_of(namespace, cycle);
        if !self.proxies.contains_key(&key) {
            let mut proxy = TaskProxy::new(namespace, cycle, now);
            proxy.prerequisites = prerequisites;
            if above_horizon {
                proxy.state = TaskState::Runahead;
                self.runahead.push(key.clone());
            }
            self.proxies.insert(key.clone(), proxy);
            self.insertion_order.insert(key.clone(), self.next_seq);
            self.next_seq += 1;
            debug!(namespace, cycle, above_horizon, "spawned proxy");
        }
        self.proxies.get_mut(&key).expect("just inserted")
    }

    pub fn get(&self, namespace: &str, cycle: &str) -> Option<&TaskProxy> {
        self.proxies.get(&key_of(namespace, cycle))
    }

    pub fn get_mut(&mut self, namespace: &str, cycle: &str) -> Option<&mut TaskProxy> {
        self.proxies.get_mut(&key_of(namespace, cycle))
    }

    pub fn all(&self) -> impl Iterator<Item = &TaskProxy> {
        self.proxies.values()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut TaskProxy> {
        self.proxies.values_mut()
    }

    /// Mark the given `(upstream_name, upstream_cycle, output)` as
    /// satisfied on `namespace/cycle`'s prerequisites. Returns `true` if
    /// the proxy's prerequisites are now all satisfied.
    pub fn update_prereq(
        &mut self,
        namespace: &str,
        cycle: &str,
        upstream_name: &str,
        upstream_cycle: &str,
        output: &str,
    ) -> bool {
        match self.proxies.get_mut(&key_of(namespace, cycle)) {
            Some(proxy) => proxy.prerequisites.mark_satisfied(upstream_name, upstream_cycle, output),
            None => false,
        }
    }

    /// Proxies in `waiting` whose prerequisites are satisfied and whose
    /// queue (if any) has capacity, tie-broken by `(cycle, namespace)`
    /// then insertion order.
    pub fn ready_iter(&self) -> Vec<ProxyKey> {
        let mut candidates: Vec<&TaskProxy> = self
            .proxies
            .values()
            .filter(|p| {
                p.state == TaskState::Waiting && !p.is_held && p.prerequisites.is_satisfied() && self.queue_has_capacity(&p.namespace)
            })
            .collect();

        candidates.sort_by(|a, b| {
            (a.cycle_point.as_str(), a.namespace.as_str())
                .cmp(&(b.cycle_point.as_str(), b.namespace.as_str()))
                .then_with(|| {
                    let ai = self.insertion_order.get(&key_of(&a.namespace, &a.cycle_point)).copied().unwrap_or(0);
                    let bi = self.insertion_order.get(&key_of(&b.namespace, &b.cycle_point)).copied().unwrap_or(0);
                    ai.cmp(&bi)
                })
        });

        candidates.into_iter().map(|p| key_of(&p.namespace, &p.cycle_point)).collect()
    }

    fn queue_has_capacity(&self, namespace: &str) -> bool {
        match self.queue_of.get(namespace) {
            None => true,
            Some(queue_name) => match self.queues.get(queue_name) {
                Some(q) => q.running < q.limit,
                None => true,
            },
        }
    }

    /// Move `waiting` -> `queued` if the named queue is at its limit,
    /// otherwise directly to `ready`.
    pub fn queue_admit(&mut self, namespace: &str, cycle: &str, now: i64) -> Result<(), crate::domain::ProxyError> {
        let has_capacity = self.queue_has_capacity(namespace);
        let queue_name = self.queue_of.get(namespace).cloned();
        if let Some(proxy) = self.get_mut(namespace, cycle) {
            if has_capacity {
                proxy.transition(TaskState::Queued, now)?;
                proxy.transition(TaskState::Ready, now)?;
                if let Some(queue_name) = queue_name {
                    if let Some(q) = self.queues.get_mut(&queue_name) {
                        q.running += 1;
                    }
                }
            } else {
                proxy.transition(TaskState::Queued, now)?;
            }
        }
        Ok(())
    }

    pub fn release_queue_slot(&mut self, namespace: &str) {
        if let Some(queue_name) = self.queue_of.get(namespace) {
            if let Some(q) = self.queues.get_mut(queue_name) {
                q.running = q.running.saturating_sub(1);
            }
        }
    }

    /// Promote proxies from the runahead list into `waiting` as the
    /// active-cycle-points window advances. `cycle_rank` maps a cycle
    /// string to a comparable integer step (the resolver owns the
    /// actual `CyclePoint`/`Recurrence` arithmetic); this stays generic
    /// over both cycling kinds.
    pub fn advance_runahead(&mut self, cycle_rank: impl Fn(&str) -> i64, now: i64) {
        let oldest_active = self
            .proxies
            .values()
            .filter(|p| !p.state.is_terminal() && p.state != TaskState::Runahead)
            .map(|p| cycle_rank(&p.cycle_point))
            .min();

        let Some(oldest_active) = oldest_active else { return };
        let horizon = oldest_active + (self.max_active_cycle_points as i64 - 1);

        let mut promote = Vec::new();
        for key in &self.runahead {
            if let Some(proxy) = self.proxies.get(key) {
                if cycle_rank(&proxy.cycle_point) <= horizon {
                    promote.push(key.clone());
                }
            }
        }

        for key in &promote {
            if let Some(proxy) = self.proxies.get_mut(key) {
                let _ = proxy.transition(TaskState::Waiting, now);
            }
        }
        self.runahead.retain(|k| !promote.contains(k));
    }

    /// Remove a terminal proxy once it is provably unreferenced: the
    /// caller (the dependency resolver, which knows the edge graph)
    /// asserts `no_live_consumer` itself.
    pub fn evict(&mut self, namespace: &str, cycle: &str, no_live_consumer: bool, below_runahead_horizon: bool) -> bool {
        let key = key_of(namespace, cycle);
        let Some(proxy) = self.proxies.get(&key) else { return false };
        if proxy.state.is_terminal() && no_live_consumer && below_runahead_horizon {
            self.proxies.remove(&key);
            self.insertion_order.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn count_active_cycle_points(&self) -> usize {
        self.proxies
            .values()
            .filter(|p| !p.state.is_terminal() && p.state != TaskState::Runahead)
            .map(|p| p.cycle_point.clone())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    /// `true` iff no proxy can make progress without external
    /// intervention: nothing is `{ready, submitted, running,
    /// submit-retrying, retrying}`, no clock/xtrigger is pending, and at
    /// least one proxy is stuck (unsatisfied prerequisites, or
    /// `failed`/`submit-failed` with no handler-driven recovery
    /// in flight).
    pub fn is_stalled(&self, pending_external_trigger: bool) -> bool {
        if pending_external_trigger {
            return false;
        }
        let any_progressing = self.proxies.values().any(|p| {
            matches!(
                p.state,
                TaskState::Ready | TaskState::Submitted | TaskState::Running | TaskState::SubmitRetrying | TaskState::Retrying
            )
        });
        if any_progressing {
            return false;
        }
        self.proxies.values().any(|p| {
            !p.prerequisites.is_satisfied() || matches!(p.state, TaskState::Failed | TaskState::SubmitFailed)
        })
    }

    pub fn incomplete_report(&self) -> Vec<IncompleteReport> {
        self.proxies
            .values()
            .filter(|p| !p.state.is_terminal() && !p.prerequisites.is_satisfied())
            .map(|p| IncompleteReport {
                namespace: p.namespace.clone(),
                cycle: p.cycle_point.clone(),
                unmet: p
                    .prerequisites
                    .unmet()
                    .iter()
                    .map(|t| format!("{}/{}:{}", t.upstream_cycle, t.upstream_name, t.output))
                    .collect(),
            })
            .collect()
    }

    pub fn storage_key(namespace: &str, cycle: &str) -> String {
        proxy_key(namespace, cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_is_idempotent() {
        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
        pool.spawn("a", "1", false, 0);
        let seq_before = pool.insertion_order.len();
        pool.spawn("a", "1", false, 0);
        assert_eq!(pool.insertion_order.len(), seq_before);
    }

    #[test]
    fn update_prereq_reports_full_satisfaction() {
        use crate::domain::proxy::{PrereqGroup, PrereqTriple, Prerequisites};

        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
        let proxy = pool.spawn("b", "1", false, 0);
        proxy.prerequisites = Prerequisites(vec![PrereqGroup(vec![PrereqTriple::new("a", "1", "succeeded")])]);

        let became_satisfied = pool.update_prereq("b", "1", "a", "1", "succeeded");
        assert!(became_satisfied);
    }

    #[test]
    fn ready_iter_respects_queue_capacity() {
        let mut queue_of = HashMap::new();
        queue_of.insert("a".to_string(), "default".to_string());
        let mut queues = HashMap::new();
        queues.insert("default".to_string(), QueueLimit { limit: 0, running: 0 });

        let mut pool = TaskPool::new(3, queue_of, queues);
        pool.spawn("a", "1", false, 0);
        assert!(pool.ready_iter().is_empty());
    }

    #[test]
    fn runahead_promotes_within_horizon() {
        let mut pool = TaskPool::new(2, HashMap::new(), HashMap::new());
        pool.spawn("a", "1", false, 0);
        pool.spawn("a", "3", true, 0);

        pool.advance_runahead(|c| c.parse().unwrap(), 1);
        assert_eq!(pool.get("a", "3").unwrap().state, TaskState::Waiting);
    }

    #[test]
    fn runahead_cap_blocks_cycle_past_horizon() {
        let mut pool = TaskPool::new(2, HashMap::new(), HashMap::new());
        pool.spawn("a", "1", false, 0);
        pool.spawn("a", "4", true, 0);

        pool.advance_runahead(|c| c.parse().unwrap(), 1);
        assert_eq!(pool.get("a", "4").unwrap().state, TaskState::Runahead);
    }

    #[test]
    fn stall_detected_when_nothing_can_progress() {
        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
        let proxy = pool.spawn("a", "1", false, 0);
        let _ = proxy.transition(TaskState::Queued, 1);
        let _ = proxy.transition(TaskState::Ready, 1);
        let _ = proxy.transition(TaskState::Submitted, 1);
        let _ = proxy.transition(TaskState::Running, 1);
        let _ = proxy.transition(TaskState::Failed, 1);
        assert!(pool.is_stalled(false));
    }

    #[test]
    fn not_stalled_while_external_trigger_pending() {
        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());
        let proxy = pool.spawn("a", "1", false, 0);
        let _ = proxy.transition(TaskState::Queued, 1);
        let _ = proxy.transition(TaskState::Ready, 1);
        let _ = proxy.transition(TaskState::Submitted, 1);
        let _ = proxy.transition(TaskState::Running, 1);
        let _ = proxy.transition(TaskState::Failed, 1);
        assert!(!pool.is_stalled(true));
    }
}
