//! Error types for the persistent store.

use thiserror::Error;

/// Errors surfaced by [`crate::Store`] and its collaborators.
///
/// Any variant here that reaches the scheduler loop is treated as fatal:
/// the scheduler aborts rather than continue against possibly-inconsistent
/// state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("no open batch to commit")]
    NoOpenBatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
