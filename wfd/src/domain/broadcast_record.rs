//! `BroadcastRecord`: the `wfstore`-persisted mirror of a
//! `wfbroadcast::BroadcastEntry`.
//!
//! `wfbroadcast` is deliberately store-agnostic (see its own module
//! doc), so the persistence side of "set operations record to the
//! persistent store before returning" lives here instead: this record
//! type is what `wfd` actually puts in `broadcast_states`, and
//! `load`/`persist_set`/`persist_clear`/`persist_expire` are the glue
//! between the in-memory `BroadcastStore` and the store.

use serde::{Deserialize, Serialize};
use wfbroadcast::{BroadcastEntry, BroadcastStore, BroadcastTarget};
use wfstore::{IndexValue, Record, Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub id: String,
    pub namespace: String,
    pub cycle: String,
    pub key_path: String,
    pub value: serde_json::Value,
    pub set_at: i64,
}

impl BroadcastRecord {
    fn id_for(target: &BroadcastTarget, key_path: &str) -> String {
        format!("{}/{}/{}", target.namespace, target.cycle, key_path)
    }

    fn from_entry(entry: &BroadcastEntry) -> Self {
        Self {
            id: Self::id_for(&entry.target, &entry.key_path),
            namespace: entry.target.namespace.clone(),
            cycle: entry.target.cycle.clone(),
            key_path: entry.key_path.clone(),
            value: entry.value.clone(),
            set_at: entry.set_at,
        }
    }

    fn into_entry(self) -> BroadcastEntry {
        BroadcastEntry {
            target: BroadcastTarget::new(self.namespace, self.cycle),
            key_path: self.key_path,
            value: self.value,
            set_at: self.set_at,
        }
    }
}

impl Record for BroadcastRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.set_at
    }
    fn collection_name() -> &'static str {
        "broadcast_states"
    }
    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![("namespace", IndexValue::Text(self.namespace.clone())), ("cycle", IndexValue::Text(self.cycle.clone()))]
    }
}

/// Rebuilds a `BroadcastStore` from whatever `broadcast_states` holds,
/// the way a restarted scheduler recovers its overlay state.
pub fn load(store: &Store) -> Result<BroadcastStore, StoreError> {
    let entries = store.list_all::<BroadcastRecord>()?.into_iter().map(BroadcastRecord::into_entry).collect();
    Ok(BroadcastStore::from_entries(entries))
}

/// Applies `set` to the live store and persists the resulting entry
/// before returning, per the component design's durability contract.
pub fn persist_set(
    store: &Store,
    broadcast: &BroadcastStore,
    target: BroadcastTarget,
    key_path: impl Into<String>,
    value: serde_json::Value,
) -> Result<BroadcastEntry, StoreError> {
    let entry = broadcast.set(target, key_path, value);
    store.put(&BroadcastRecord::from_entry(&entry))?;
    Ok(entry)
}

/// Applies `clear` to the live store and deletes the matching persisted
/// records; `keys` empty means "every key under `target`".
pub fn persist_clear(store: &Store, broadcast: &BroadcastStore, target: &BroadcastTarget, keys: &[String]) -> Result<usize, StoreError> {
    let before = broadcast.all_entries();
    let removed = broadcast.clear(target, keys);
    for entry in before {
        if entry.target == *target && (keys.is_empty() || keys.contains(&entry.key_path)) {
            store.delete::<BroadcastRecord>(&BroadcastRecord::id_for(&entry.target, &entry.key_path))?;
        }
    }
    Ok(removed)
}

/// Applies `expire` to the live store and deletes the persisted records
/// whose cycle point fell before the horizon.
pub fn persist_expire(
    store: &Store,
    broadcast: &BroadcastStore,
    is_before: impl Fn(&str) -> bool,
) -> Result<usize, StoreError> {
    let before = broadcast.all_entries();
    let removed = broadcast.expire(&is_before);
    for entry in before {
        if entry.target.cycle != "*" && is_before(&entry.target.cycle) {
            store.delete::<BroadcastRecord>(&BroadcastRecord::id_for(&entry.target, &entry.key_path))?;
        }
    }
    Ok(removed)
}
