//! Transactional write batches.
//!
//! Every state transition, submission, and broadcast set the scheduler
//! makes must be durable before it is observable to any other
//! component. A [`Batch`] groups the writes of one scheduler tick into a
//! single SQLite transaction: either all of them land, or none do.

use std::sync::MutexGuard;

use rusqlite::Connection;

use crate::db::Store;
use crate::error::StoreResult;
use crate::record::Record;

/// A held write transaction. Drop without calling [`Batch::commit`] to
/// roll back.
pub struct Batch<'s> {
    conn: MutexGuard<'s, Connection>,
    committed: bool,
}

impl Store {
    /// Begin a write batch. Only one batch may be open on a `Store` at
    /// a time; this is enforced by the store's internal mutex, which the
    /// batch holds for its whole lifetime.
    pub fn begin_batch(&self) -> StoreResult<Batch<'_>> {
        let conn = self.raw_conn_for_batch()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Batch { conn, committed: false })
    }

    fn raw_conn_for_batch(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        Ok(self.conn_mutex().lock().expect("store mutex poisoned"))
    }
}

impl<'s> Batch<'s> {
    pub fn put<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        crate::db::put_in_tx(&self.conn, record)
    }

    pub fn delete<T: Record>(&mut self, id: &str) -> StoreResult<()> {
        self.conn.execute("DELETE FROM records WHERE collection = ?1 AND id = ?2", (T::collection_name(), id))?;
        self.conn
            .execute("DELETE FROM record_index WHERE collection = ?1 AND id = ?2", (T::collection_name(), id))?;
        Ok(())
    }

    /// Persist every write made on this batch atomically. Any error here
    /// is fatal to the caller: a failed commit means the in-memory pool
    /// state and the store have diverged.
    pub fn commit(mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl<'s> Drop for Batch<'s> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
