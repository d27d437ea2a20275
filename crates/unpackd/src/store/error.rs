use std::path::PathBuf;

use thiserror::Error;

use crate::db::{CorruptRow, DatabaseError, Retryable};
use crate::domain::{ItemStatus, JobStatus, TransitionError};

/// Errors surfaced by `JobStore` operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The caller left required policy fields unset.
    #[error("Missing job options: {}", .0.join(", "))]
    MissingOptions(Vec<&'static str>),

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Item {item_id} is not running (status: {status})")]
    NotRunning { item_id: i64, status: ItemStatus },

    #[error("Job {job_id} cannot be deleted while {status}")]
    NotDeletable { job_id: i64, status: JobStatus },

    #[error("{entity} {id} cannot be retried: {reason}")]
    NotRetriable {
        entity: &'static str,
        id: i64,
        reason: String,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    CorruptRow(#[from] CorruptRow),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn job_not_found(id: i64) -> Self {
        StoreError::NotFound { entity: "Job", id }
    }

    pub(crate) fn item_not_found(id: i64) -> Self {
        StoreError::NotFound { entity: "Item", id }
    }
}

impl Retryable for StoreError {
    fn is_busy(&self) -> bool {
        match self {
            StoreError::Database(e) => e.is_busy(),
            _ => false,
        }
    }
}
