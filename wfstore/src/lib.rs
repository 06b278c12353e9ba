//! Generic indexed record store backing the scheduler's persistent
//! state.
//!
//! A [`Store`] is a single SQLite file holding one logical collection
//! per domain type (task pool, task states, job records, broadcasts,
//! timers, ...), all implementing the [`Record`] trait. Writes go
//! through [`Batch`] so that a tick's worth of state transitions lands
//! atomically; [`checkpoint`] and [`load`] give named snapshots for
//! crash-restart recovery.

mod batch;
mod checkpoint;
mod db;
mod error;
mod record;
mod schema;

pub use batch::Batch;
pub use checkpoint::{CheckpointRecord, LoadTarget};
pub use db::Store;
pub use error::{StoreError, StoreResult};
pub use record::{Filter, FilterOp, IndexValue, Record};
pub use schema::{CURRENT_SCHEMA_VERSION, COLLECTIONS};
