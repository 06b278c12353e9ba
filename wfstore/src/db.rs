//! The generic record store backing the scheduler's persisted state.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::record::{Filter, Record};
use crate::schema;

/// A single-file embedded store holding every collection the scheduler
/// persists. Single-writer: the scheduler loop owns the only `&mut`
/// access path (through [`crate::Batch`]); concurrent readers should
/// open their own read-only connection against the same path.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if absent) the store at `path`. Runs schema
    /// migration if an older recognized schema is found, and logs a
    /// recovery banner if the previous run did not leave a clean
    /// shutdown marker.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "opening store");
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init(&conn)?;

        if !schema::has_clean_shutdown_marker(&conn)? {
            info!(path = %path.display(), "no clean-shutdown marker found, recovering");
        }
        schema::clear_clean_shutdown_marker(&conn)?;

        Ok(Self { conn: Mutex::new(conn), path })
    }

    /// Open an in-memory store, used by tests and by `wfd validate`
    /// when no persistent run directory is requested.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn), path: PathBuf::from(":memory:") })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks this run as having shut down cleanly, so the next `open`
    /// skips the recovery banner. Callers invoke this once, at the end
    /// of an orderly shutdown, never on a crash path.
    pub fn mark_clean_shutdown(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        schema::write_clean_shutdown_marker(&conn, chrono::Utc::now().timestamp_millis())
    }

    pub(crate) fn conn_mutex(&self) -> &Mutex<Connection> {
        &self.conn
    }

    /// Persist `record` under its collection, overwriting any existing
    /// row with the same id, and refreshing its index entries.
    pub fn put<T: Record>(&self, record: &T) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        put_in_tx(&conn, record)
    }

    pub fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                (T::collection_name(), id),
                |row| row.get(0),
            )
            .ok();
        data.map(|d| serde_json::from_str(&d).map_err(StoreError::from)).transpose()
    }

    pub fn require<T: Record>(&self, id: &str) -> StoreResult<T> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound(format!("{}/{}", T::collection_name(), id)))
    }

    pub fn delete<T: Record>(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            (T::collection_name(), id),
        )?;
        conn.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            (T::collection_name(), id),
        )?;
        Ok(())
    }

    /// List every record in `T`'s collection matching all of `filters`,
    /// ordered by `updated_at` ascending.
    pub fn query<T: Record>(&self, filters: &[Filter]) -> StoreResult<Vec<T>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let ids = filtered_ids(&conn, T::collection_name(), filters)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let data: String = conn.query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                (T::collection_name(), &id),
                |row| row.get(0),
            )?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }

    pub fn list_all<T: Record>(&self) -> StoreResult<Vec<T>> {
        self.query(&[])
    }

    /// Recompute the index table for every row of `T`'s collection.
    /// Called after a bulk `load` or a schema migration, where rows may
    /// have been written by a prior build with different indexed
    /// fields.
    pub fn rebuild_indexes<T: Record>(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM record_index WHERE collection = ?1", [T::collection_name()])?;
        let mut stmt = conn.prepare("SELECT data FROM records WHERE collection = ?1")?;
        let rows = stmt.query_map([T::collection_name()], |row| row.get::<_, String>(0))?;
        for row in rows {
            let data = row?;
            let record: T = serde_json::from_str(&data)?;
            write_index(&conn, T::collection_name(), &record)?;
        }
        Ok(())
    }
}

pub(crate) fn put_in_tx<T: Record>(conn: &Connection, record: &T) -> StoreResult<()> {
    let data = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO records (collection, id, updated_at, data) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET updated_at = excluded.updated_at, data = excluded.data",
        (T::collection_name(), record.id(), record.updated_at(), &data),
    )?;
    conn.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
        (T::collection_name(), record.id()),
    )?;
    write_index(conn, T::collection_name(), record)?;
    Ok(())
}

fn write_index<T: Record>(conn: &Connection, collection: &'static str, record: &T) -> StoreResult<()> {
    for (field, value) in record.indexed_fields() {
        conn.execute(
            "INSERT INTO record_index (collection, id, field, value) VALUES (?1, ?2, ?3, ?4)",
            (collection, record.id(), field, value.to_sql_text()),
        )?;
    }
    Ok(())
}

fn filtered_ids(conn: &Connection, collection: &'static str, filters: &[Filter]) -> StoreResult<Vec<String>> {
    if filters.is_empty() {
        let mut stmt = conn.prepare(
            "SELECT id FROM records WHERE collection = ?1 ORDER BY updated_at ASC",
        )?;
        let ids = stmt.query_map([collection], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
        return Ok(ids);
    }

    // Intersect one indexed-field query per filter; small collections
    // and small filter counts make this adequate without a query
    // planner.
    let mut candidate: Option<Vec<String>> = None;
    for filter in filters {
        let sql = format!(
            "SELECT id FROM record_index WHERE collection = ?1 AND field = ?2 AND value {} ?3",
            filter.op.as_sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map((collection, filter.field, filter.value.to_sql_text()), |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        candidate = Some(match candidate {
            None => ids,
            Some(prev) => prev.into_iter().filter(|id| ids.contains(id)).collect(),
        });
    }
    let mut ids = candidate.unwrap_or_default();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IndexValue;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        updated_at: i64,
        owner: String,
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }
        fn updated_at(&self) -> i64 {
            self.updated_at
        }
        fn collection_name() -> &'static str {
            "widgets"
        }
        fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
            vec![("owner", IndexValue::Text(self.owner.clone()))]
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let w = Widget { id: "w1".into(), updated_at: 1, owner: "alice".into() };
        store.put(&w).unwrap();
        let got: Widget = store.require("w1").unwrap();
        assert_eq!(got, w);
    }

    #[test]
    fn get_missing_is_none() {
        let store = Store::open_in_memory().unwrap();
        let got: Option<Widget> = store.get("nope").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn query_by_index() {
        let store = Store::open_in_memory().unwrap();
        store.put(&Widget { id: "w1".into(), updated_at: 1, owner: "alice".into() }).unwrap();
        store.put(&Widget { id: "w2".into(), updated_at: 2, owner: "bob".into() }).unwrap();
        let alice_widgets: Vec<Widget> = store.query(&[Filter::eq("owner", "alice")]).unwrap();
        assert_eq!(alice_widgets.len(), 1);
        assert_eq!(alice_widgets[0].id, "w1");
    }

    #[test]
    fn delete_removes_record_and_index() {
        let store = Store::open_in_memory().unwrap();
        store.put(&Widget { id: "w1".into(), updated_at: 1, owner: "alice".into() }).unwrap();
        store.delete::<Widget>("w1").unwrap();
        let got: Option<Widget> = store.get("w1").unwrap();
        assert!(got.is_none());
        let alice_widgets: Vec<Widget> = store.query(&[Filter::eq("owner", "alice")]).unwrap();
        assert!(alice_widgets.is_empty());
    }

    #[test]
    fn mark_clean_shutdown_then_reopen_sees_no_recovery_banner() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("store.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store.mark_clean_shutdown().unwrap();
        }
        let conn = Connection::open(&path).unwrap();
        assert!(schema::has_clean_shutdown_marker(&conn).unwrap());
        // Reopening clears the marker again, the way a fresh run does
        // until its own clean shutdown sets it.
        let _ = Store::open(&path).unwrap();
        assert!(!schema::has_clean_shutdown_marker(&conn).unwrap());
    }

    #[test]
    fn rebuild_indexes_after_manual_insert() {
        let store = Store::open_in_memory().unwrap();
        let w = Widget { id: "w1".into(), updated_at: 1, owner: "alice".into() };
        store.put(&w).unwrap();
        store.rebuild_indexes::<Widget>().unwrap();
        let alice_widgets: Vec<Widget> = store.query(&[Filter::eq("owner", "alice")]).unwrap();
        assert_eq!(alice_widgets.len(), 1);
    }
}
