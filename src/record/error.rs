//! Error types for record store operations.

use std::fmt;

use thiserror::Error;

/// Coarse classification of a failed store query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// Another connection holds the write lock.
    Busy,
    /// A CHECK, NOT NULL or UNIQUE constraint rejected the row.
    Constraint,
    /// The pool is closed, exhausted, or the file is unreachable.
    Unavailable,
    /// Anything else.
    Other,
}

impl StoreDbErrorKind {
    /// Classifies a sqlx failure.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable
            }
            sqlx::Error::Database(db) => {
                let code = db.code();
                let code = code.as_deref().unwrap_or_default();
                // Extended result codes arrive as numbers: 5 busy, 6 locked.
                if matches!(code, "5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED")
                    || db.message().contains("database is locked")
                {
                    Self::Busy
                } else if db.is_check_violation()
                    || db.is_unique_violation()
                    || code.starts_with("SQLITE_CONSTRAINT")
                    || code == "19"
                {
                    Self::Constraint
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }

    /// Returns the log label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Constraint => "constraint",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during record store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification of the failure.
        kind: StoreDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// No record with this id.
    #[error("download record not found: id {0}")]
    RecordNotFound(i64),

    /// A selection string failed validation before reaching the store.
    #[error("invalid selection at offset {offset}: {reason}")]
    InvalidSelection {
        /// Byte offset of the offending token.
        offset: usize,
        /// What was wrong.
        reason: String,
    },

    /// Selection placeholders and arguments disagree.
    #[error("selection expects {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Number of `?` placeholders.
        expected: usize,
        /// Number of supplied arguments.
        actual: usize,
    },

    /// Request rejected before insertion.
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    /// The single writer task is no longer running.
    #[error("record writer has shut down")]
    WriterClosed,
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
    /// Creates an `InvalidSelection` error.
    #[must_use]
    pub fn invalid_selection(offset: usize, reason: impl Into<String>) -> Self {
        Self::InvalidSelection {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// The database classification, for `Database` errors.
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True when repeating the same write may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.database_kind() == Some(StoreDbErrorKind::Busy)
    }
}
