//! Named checkpoint snapshots.
//!
//! A checkpoint is a whole-database snapshot taken with SQLite's
//! `VACUUM INTO`, recorded in the `checkpoint_id` collection so `load`
//! can find it again by label. Unlike the `records`/`record_index`
//! tables, checkpoint files are immutable once written.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};
use crate::record::{IndexValue, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub label: String,
    pub created_at: i64,
    pub file_name: String,
}

impl Record for CheckpointRecord {
    fn id(&self) -> &str {
        &self.label
    }
    fn updated_at(&self) -> i64 {
        self.created_at
    }
    fn collection_name() -> &'static str {
        "checkpoint_id"
    }
    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![("created_at", IndexValue::Int(self.created_at))]
    }
}

/// Which state to reconstruct from when starting up.
pub enum LoadTarget<'a> {
    /// Start from the live, most-recent state (normal restart).
    Initial,
    /// Reconstruct from a named checkpoint taken earlier in this run.
    Checkpoint(&'a str),
}

impl Store {
    /// Write a named snapshot of the live tables, sufficient for
    /// [`load`](Store::load) to later reconstruct the pool, timers,
    /// broadcasts and outputs from it.
    pub fn checkpoint(&self, label: &str, created_at: i64) -> StoreResult<PathBuf> {
        let dir = checkpoints_dir(self.path());
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("{label}.sqlite");
        let dest = dir.join(&file_name);
        if dest.exists() {
            std::fs::remove_file(&dest)?;
        }

        {
            let conn = self.conn_mutex().lock().expect("store mutex poisoned");
            conn.execute("VACUUM INTO ?1", [dest.to_string_lossy().to_string()])?;
        }

        self.put(&CheckpointRecord { label: label.to_string(), created_at, file_name })?;
        tracing::info!(label, path = %dest.display(), "wrote checkpoint");
        Ok(dest)
    }

    /// Open the store that `target` names: either the live database at
    /// `path`, or a named checkpoint snapshot found under its
    /// checkpoints directory.
    pub fn load(path: impl AsRef<Path>, target: LoadTarget<'_>) -> StoreResult<Store> {
        let path = path.as_ref();
        match target {
            LoadTarget::Initial => Store::open(path),
            LoadTarget::Checkpoint(label) => {
                let live = Store::open(path)?;
                let record: CheckpointRecord = live
                    .get(label)?
                    .ok_or_else(|| StoreError::CheckpointNotFound(label.to_string()))?;
                let snapshot_path = checkpoints_dir(path).join(&record.file_name);
                Store::open(&snapshot_path)
            }
        }
    }
}

fn checkpoints_dir(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checkpoint_then_load_by_label() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("store.sqlite");
        let store = Store::open(&db_path).unwrap();

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        struct Marker {
            id: String,
            updated_at: i64,
        }
        impl Record for Marker {
            fn id(&self) -> &str {
                &self.id
            }
            fn updated_at(&self) -> i64 {
                self.updated_at
            }
            fn collection_name() -> &'static str {
                "markers"
            }
        }

        store.put(&Marker { id: "m1".into(), updated_at: 1 }).unwrap();
        store.checkpoint("before-restart", 100).unwrap();

        let loaded = Store::load(&db_path, LoadTarget::Checkpoint("before-restart")).unwrap();
        let got: Marker = loaded.require("m1").unwrap();
        assert_eq!(got.id, "m1");
    }

    #[test]
    fn load_missing_checkpoint_errors() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("store.sqlite");
        Store::open(&db_path).unwrap();
        let result = Store::load(&db_path, LoadTarget::Checkpoint("does-not-exist"));
        assert!(matches!(result, Err(StoreError::CheckpointNotFound(_))));
    }
}
