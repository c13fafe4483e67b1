//! Error types for store operations.

use std::fmt;

use thiserror::Error;

/// What kind of database failure a [`StoreError::Database`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// Another connection or process holds the write lock.
    BusyOrLocked,
    /// No pooled connection became free in time.
    PoolTimeout,
    /// A CHECK, UNIQUE or foreign-key constraint rejected the write.
    Constraint,
    Other,
}

impl StoreDbErrorKind {
    fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                // SQLITE_BUSY = 5, SQLITE_LOCKED = 6, extended codes keep the low byte
                let primary = code
                    .as_deref()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| code & 0xff);
                if matches!(primary, Some(5 | 6))
                    || database_error.message().contains("database is locked")
                {
                    Self::BusyOrLocked
                } else if database_error.is_check_violation()
                    || database_error.is_unique_violation()
                    || database_error.is_foreign_key_violation()
                {
                    Self::Constraint
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BusyOrLocked => "busy",
            Self::PoolTimeout => "pool_timeout",
            Self::Constraint => "constraint",
            Self::Other => "other",
        })
    }
}

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database {
        kind: StoreDbErrorKind,
        message: String,
    },

    #[error("download not found: id {0}")]
    DownloadNotFound(i64),

    #[error("download group not found: {0}")]
    GroupNotFound(String),

    /// A persisted status column holds a value the engine does not know.
    #[error("invalid status '{0}', expected one of the known lifecycle states")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    #[must_use]
    pub fn invalid_status(status: &str) -> Self {
        Self::InvalidStatus(status.to_string())
    }

    /// True for lock contention that a later attempt can get past.
    ///
    /// The write gate only orders writers inside one process, so a CLI
    /// writing to the same file can still make the worker's statements wait
    /// past the busy timeout.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: StoreDbErrorKind::BusyOrLocked | StoreDbErrorKind::PoolTimeout,
                ..
            }
        )
    }
}
