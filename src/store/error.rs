use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::model::DateSpan;

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Another restriction already occupies part of the requested stay.
    #[error("{span} conflicts with restriction {existing}")]
    Conflict { existing: Ulid, span: DateSpan },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl StorageError {
    /// True for the classes a request handler recovers from locally
    /// instead of failing the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::Conflict { .. })
    }
}
