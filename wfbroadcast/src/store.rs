//! The broadcast store: a mutex-guarded collection of active entries
//! with ordered-merge lookup.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::entry::{BroadcastEntry, BroadcastTarget};
use crate::pattern;

struct Inner {
    entries: Vec<BroadcastEntry>,
    next_set_at: i64,
}

/// Hierarchical key-path overrides applied at task-instance
/// materialization. Pure in-process state; callers persist entries
/// through `wfstore`'s `broadcast_states` collection themselves (the
/// store here does not know about `wfstore`).
pub struct BroadcastStore {
    inner: Mutex<Inner>,
}

impl Default for BroadcastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { entries: Vec::new(), next_set_at: 0 }) }
    }

    /// Rebuild from entries loaded out of the persistent store (used on
    /// restart).
    pub fn from_entries(entries: Vec<BroadcastEntry>) -> Self {
        let next_set_at = entries.iter().map(|e| e.set_at).max().unwrap_or(0) + 1;
        Self { inner: Mutex::new(Inner { entries, next_set_at }) }
    }

    /// Set `key_path = value` for every namespace/cycle matched by
    /// `target`. Returns the entry that was recorded, which callers
    /// persist to the store before this call is considered durable.
    pub fn set(&self, target: BroadcastTarget, key_path: impl Into<String>, value: Value) -> BroadcastEntry {
        let mut inner = self.inner.lock().expect("broadcast store mutex poisoned");
        let set_at = inner.next_set_at;
        inner.next_set_at += 1;
        let key_path = key_path.into();
        inner.entries.retain(|e| !(e.target == target && e.key_path == key_path));
        let entry = BroadcastEntry { target, key_path, value, set_at };
        inner.entries.push(entry.clone());
        entry
    }

    /// Remove entries matching `target` restricted to `keys`, or all
    /// keys if `keys` is empty.
    pub fn clear(&self, target: &BroadcastTarget, keys: &[String]) -> usize {
        let mut inner = self.inner.lock().expect("broadcast store mutex poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|e| {
            if e.target != *target {
                return true;
            }
            !(keys.is_empty() || keys.contains(&e.key_path))
        });
        before - inner.entries.len()
    }

    /// Drop every entry whose target's cycle point string sorts at or
    /// before `before_point` among the supplied order relation. Callers
    /// pass in already-resolved cycle strings since `wfbroadcast` has no
    /// knowledge of `CyclePoint` ordering.
    pub fn expire(&self, is_before: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.inner.lock().expect("broadcast store mutex poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|e| e.target.cycle == "*" || !is_before(&e.target.cycle));
        before - inner.entries.len()
    }

    /// The effective overrides for a proxy in namespace `ancestry`
    /// (closest-first) at `cycle`: an ordered merge, root -> parents ->
    /// exact namespace, and `*` cycle -> exact cycle, later `set_at`
    /// breaking ties at equal specificity.
    pub fn lookup(&self, ancestry: &[&str], cycle: &str) -> HashMap<String, Value> {
        let inner = self.inner.lock().expect("broadcast store mutex poisoned");
        let mut matches: Vec<&BroadcastEntry> =
            inner.entries.iter().filter(|e| pattern::matches(&e.target, ancestry, cycle)).collect();
        matches.sort_by_key(|e| (pattern::specificity(&e.target, ancestry), e.set_at));

        let mut merged = HashMap::new();
        for entry in matches {
            merged.insert(entry.key_path.clone(), entry.value.clone());
        }
        merged
    }

    pub fn all_entries(&self) -> Vec<BroadcastEntry> {
        self.inner.lock().expect("broadcast store mutex poisoned").entries.clone()
    }
}
