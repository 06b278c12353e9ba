//! The broadcast entry value type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Selects which namespaces and cycles a [`BroadcastEntry`] applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTarget {
    /// A namespace name, or `"root"` to match every namespace.
    pub namespace: String,
    /// A cycle-point string, or `"*"` to match every cycle.
    pub cycle: String,
}

impl BroadcastTarget {
    pub fn new(namespace: impl Into<String>, cycle: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), cycle: cycle.into() }
    }
}

/// `(namespace-pattern, cycle-pattern, key-path, value)` with a
/// `set_at` ordering, as named in the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub target: BroadcastTarget,
    /// Dotted key path into the namespace's runtime settings, e.g.
    /// `"environment.X"`.
    pub key_path: String,
    pub value: Value,
    /// Monotonic ordering token; later `set_at` wins when two entries
    /// with otherwise-equal precedence apply to the same key.
    pub set_at: i64,
}
