//! Error types for PrivStore operations
//!
//! All PrivStore errors are represented by the StoreError enum. Most of them
//! never reach callers of the public store operations: integrity and mirror-file
//! failures are logged, the transaction is rolled back and the operation reports
//! `false`/`None`. Only an exhausted stale-handle retry is surfaced.

use std::path::PathBuf;

use rusqlite::ErrorCode;

/// SQLITE_READONLY_DBMOVED: the database file was renamed or unlinked under an open handle.
const SQLITE_READONLY_DBMOVED: i32 = 1032;

/// PrivStore error types with detailed context
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation on the database or mirror tree failed
    #[error("I/O error in {}: {source}", path.display())]
    Io {
        /// The file path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// SQLite reported an error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The backing handle stayed stale after the configured number of reopen attempts
    #[error("database handle still stale after {attempts} attempts")]
    StaleHandle {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// More than one settings row exists for a single application identifier
    #[error("{count} settings rows found for {app_id}")]
    DuplicateRecords {
        /// Application identifier with duplicate rows
        app_id: String,
        /// Number of rows found
        count: usize,
    },

    /// A record cannot be persisted as given
    #[error("invalid settings record: {0}")]
    InvalidRecord(String),

    /// A schema migration step failed
    #[error("migration from version {from} failed: {reason}")]
    Migration {
        /// Version the failed step started from
        from: u32,
        /// Description of the failure
        reason: String,
    },

    /// The calling thread already holds the store lock
    #[error("store lock is already held by this thread")]
    NestedTransaction,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    /// True if the error means the open handle no longer refers to a usable
    /// database file and a close-and-reopen may fix it.
    pub fn is_stale_handle(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.extended_code == SQLITE_READONLY_DBMOVED
                    || matches!(
                        err.code,
                        ErrorCode::CannotOpen
                            | ErrorCode::SystemIoFailure
                            | ErrorCode::ReadOnly
                            | ErrorCode::NotADatabase
                    )
            }
            StoreError::Sqlite(rusqlite::Error::InvalidPath(_)) => true,
            _ => false,
        }
    }
}

/// Result type alias for PrivStore operations
pub type StoreResult<T> = Result<T, StoreError>;
