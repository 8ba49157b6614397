//! Error types for the status ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to create the directory holding the database.
    #[error("Failed to prepare ledger directory: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to run a schema migration.
    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Ledger query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The bucket has not been registered with `configure`.
    #[error("Bucket not configured: {0}")]
    SourceNotConfigured(String),

    /// A status update addressed a key the ledger has never recorded.
    #[error("No ledger entry for key {0}")]
    MissingEntry(String),

    /// The database schema version is newer than supported.
    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl LedgerError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
