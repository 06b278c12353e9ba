//! Schema creation and in-place migration.
//!
//! Table names mirror the ones named in the persisted-state component
//! design: `workflow_params`, `task_pool`, `task_pool_checkpoints`,
//! `task_states`, `task_jobs`, `task_events`, `task_outputs`,
//! `task_action_timers`, `broadcast_states`, `xtriggers`,
//! `checkpoint_id`. Each is a generic `records` row keyed by id, plus a
//! shared `record_index` table for filterable fields — the `Record`
//! trait's collections all live in the same two physical tables.

use rusqlite::Connection;

use crate::error::StoreResult;

/// Current schema version this build writes and expects on open.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const COLLECTIONS: &[&str] = &[
    "workflow_params",
    "task_pool",
    "task_pool_checkpoints",
    "task_states",
    "task_jobs",
    "task_events",
    "task_outputs",
    "task_action_timers",
    "broadcast_states",
    "xtriggers",
    "checkpoint_id",
];

pub fn init(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id         TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            data       TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );
        CREATE INDEX IF NOT EXISTS records_updated_at
            ON records (collection, updated_at);
        CREATE TABLE IF NOT EXISTS record_index (
            collection TEXT NOT NULL,
            id         TEXT NOT NULL,
            field      TEXT NOT NULL,
            value      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS record_index_lookup
            ON record_index (collection, field, value);
        CREATE TABLE IF NOT EXISTS clean_shutdown (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            at INTEGER NOT NULL
        );",
    )?;

    let version: Option<u32> = conn
        .query_row("SELECT value FROM schema_meta WHERE key = 'schema_version'", [], |row| {
            row.get::<_, String>(0)
        })
        .ok()
        .and_then(|s| s.parse().ok());

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
                [CURRENT_SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(found) if found < CURRENT_SCHEMA_VERSION => {
            migrate(conn, found)?;
        }
        Some(found) if found > CURRENT_SCHEMA_VERSION => {
            return Err(crate::error::StoreError::SchemaTooNew {
                found,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        _ => {}
    }

    Ok(())
}

/// Migrate an on-disk schema at `from` forward to
/// [`CURRENT_SCHEMA_VERSION`]. Idempotent: running it twice against an
/// already-migrated database is a no-op, since each step only adds
/// tables/columns that don't yet exist.
fn migrate(conn: &Connection, from: u32) -> StoreResult<()> {
    tracing::warn!(from, to = CURRENT_SCHEMA_VERSION, "migrating store schema");
    // No prior versions exist yet; this is the landing spot for future
    // `ALTER TABLE`/backfill steps, gated on `from`.
    let _ = from;
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// `true` if the database carries a clean-shutdown marker from its
/// previous run.
pub fn has_clean_shutdown_marker(conn: &Connection) -> StoreResult<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM clean_shutdown", [], |row| row.get(0))?;
    Ok(count > 0)
}

pub fn write_clean_shutdown_marker(conn: &Connection, at_unix_ms: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO clean_shutdown (id, at) VALUES (0, ?1)
         ON CONFLICT(id) DO UPDATE SET at = excluded.at",
        [at_unix_ms],
    )?;
    Ok(())
}

pub fn clear_clean_shutdown_marker(conn: &Connection) -> StoreResult<()> {
    conn.execute("DELETE FROM clean_shutdown", [])?;
    Ok(())
}
