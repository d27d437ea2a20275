//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// The database stayed locked by another connection through every retry.
    #[error("Database busy after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl DatabaseError {
    /// Whether this is transient lock contention worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            DatabaseError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// A persisted row that no longer maps onto the domain model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Corrupt {table} row {id}: {reason}")]
pub struct CorruptRow {
    pub table: &'static str,
    pub id: i64,
    pub reason: String,
}

impl CorruptRow {
    pub(crate) fn new(table: &'static str, id: i64, reason: impl ToString) -> Self {
        Self {
            table,
            id,
            reason: reason.to_string(),
        }
    }
}
