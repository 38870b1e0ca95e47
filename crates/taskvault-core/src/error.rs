//! Error taxonomy for taskvault.
//!
//! Callers of the record store only ever see these variants. The grouping
//! decides how the external layer reacts: validation and lookup failures are
//! surfaced immediately, lock contention and transient sync failures are
//! retryable, and sync failures never fail a local mutation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for taskvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which kind of record a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Task,
    Project,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for taskvault
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Caller errors (never retried)
    // ==========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("Corrupt record at {path}: {reason}", path = path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    // ==========================================================================
    // Coordination errors (retry with backoff)
    // ==========================================================================
    #[error("Repository lock busy: {0}")]
    LockBusy(String),

    #[error("Transient sync failure: {0}")]
    Transient(String),

    // ==========================================================================
    // Synchronization errors (background visibility only)
    // ==========================================================================
    #[error("Sync error: {0}")]
    Sync(String),

    // ==========================================================================
    // Infrastructure
    // ==========================================================================
    #[error("Git error: {0}")]
    Git(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: RecordKind::Task,
            id: id.into(),
        }
    }

    pub fn project_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: RecordKind::Project,
            id: id.into(),
        }
    }

    /// Returns the error type string (for JSON responses)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::LockBusy(_) => "LOCK_BUSY",
            Self::Transient(_) => "TRANSIENT",
            Self::Sync(_) => "SYNC_ERROR",
            Self::Git(_) => "GIT_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "UNHANDLED_EXCEPTION",
        }
    }

    /// Returns whether the caller should retry the same call after a backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockBusy(_) | Self::Transient(_))
    }

    /// Returns whether the error was caused by the caller's input.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_mapping_exhaustive() {
        let cases: Vec<(Error, &str)> = vec![
            (Error::validation("x"), "VALIDATION_ERROR"),
            (Error::task_not_found("t-1"), "NOT_FOUND"),
            (Error::project_not_found("p"), "NOT_FOUND"),
            (
                Error::CorruptRecord {
                    path: PathBuf::from("tasks/t-1.json"),
                    reason: "eof".into(),
                },
                "CORRUPT_RECORD",
            ),
            (Error::LockBusy("x".into()), "LOCK_BUSY"),
            (Error::Transient("x".into()), "TRANSIENT"),
            (Error::Sync("x".into()), "SYNC_ERROR"),
            (Error::Git("x".into()), "GIT_ERROR"),
            (Error::Io(std::io::Error::other("x")), "OS_ERROR"),
            (Error::Config("x".into()), "CONFIG_ERROR"),
            (Error::Internal("x".into()), "UNHANDLED_EXCEPTION"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_type(), expected, "{err:?}");
        }
    }

    #[test]
    fn test_only_lock_and_transient_are_retryable() {
        assert!(Error::LockBusy("held".into()).is_retryable());
        assert!(Error::Transient("net".into()).is_retryable());
        assert!(!Error::Sync("rejected".into()).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::task_not_found("t-1").is_retryable());
    }

    #[test]
    fn test_not_found_display_names_kind() {
        let err = Error::task_not_found("t-abc");
        assert_eq!(err.to_string(), "task not found: t-abc");
        assert!(err.is_caller_error());
    }
}
