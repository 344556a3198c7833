//! Error types for the local store, the remote source, and the sync engine

use crate::models::EntityKind;
use thiserror::Error;

/// Failure of a local store operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The store cannot serve requests (poisoned lock, aborted worker)
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid {kind} row: {reason}")]
    InvalidRow { kind: EntityKind, reason: String },
}

impl StoreError {
    /// True when the write was rejected because a referenced parent row is missing
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
            }
            _ => false,
        }
    }
}

/// Failure of a remote call or subscription
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network unreachable, connection reset
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote call timed out")]
    Timeout,

    /// The server refused the write under its ownership rules
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("remote {kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("remote {kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    #[error("remote rejected payload: {0}")]
    Rejected(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl RemoteError {
    /// Failures that the next push attempt may resolve on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// Failures that will not resolve by retrying the same payload
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

/// Failure surfaced by the sync engine to its callers
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("no signed-in user")]
    NotSignedIn,

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(extended_code: i32) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(extended_code),
            None,
        ))
    }

    #[test]
    fn test_foreign_key_failure_is_integrity_violation() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY).is_integrity_violation());
    }

    #[test]
    fn test_other_constraint_failures_are_not() {
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE).is_integrity_violation());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_integrity_violation());
        assert!(!StoreError::Unavailable("closed".into()).is_integrity_violation());
    }

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Unavailable("offline".into()).is_transient());
        assert!(RemoteError::Unauthorized("not owner".into()).is_terminal());
        assert!(RemoteError::AlreadyExists {
            kind: EntityKind::Task,
            id: "t1".into()
        }
        .is_terminal());
    }
}
