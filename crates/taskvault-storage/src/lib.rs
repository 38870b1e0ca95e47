//! Git-backed record store for taskvault.
//!
//! Every record is one JSON file in a git working tree. Mutations run under a
//! cross-process [`RepositoryLock`] and are committed through the
//! [`CommitLog`]; a [`SyncScheduler`] periodically fetches, reconciles
//! diverged histories with the [`ConflictResolver`], and pushes.

#![forbid(unsafe_code)]

pub mod commit_log;
pub mod fsutil;
pub mod lock;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod sync;

use std::path::PathBuf;

use thiserror::Error;

pub use commit_log::{CommitLog, RecordChange};
pub use lock::{LockGuard, LockMarker, RepositoryLock};
pub use repository::{OpenOptions, RepositoryStore};
pub use resolver::{
    Candidate, ConflictResolver, Merge, Resolution, ResolutionKind, ResolutionNote, Side,
};
pub use scheduler::SyncScheduler;
pub use store::{ChangeHook, IntegrityWarning, RecordStore, TaskIter, TaskListing};
pub use sync::{SyncEngine, SyncOutcome, SyncReport, SyncStatus};

/// Record directories inside the working tree.
pub const TASKS_DIR: &str = "tasks";
pub const PROJECTS_DIR: &str = "projects";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock busy: {0}")]
    LockBusy(String),

    #[error("Git index.lock contention after {attempts} retries: {message}")]
    GitIndexLock {
        message: String,
        lock_path: PathBuf,
        attempts: usize,
    },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Push rejected (non-fast-forward): {0}")]
    NonFastForward(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Repository not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for taskvault_core::Error {
    fn from(err: StorageError) -> Self {
        use taskvault_core::Error as E;
        match err {
            StorageError::Io(e) => E::Io(e),
            StorageError::Git(e) => E::Git(e.message().to_string()),
            StorageError::Json(e) => E::Serialization(e),
            StorageError::LockBusy(msg) => E::LockBusy(msg),
            StorageError::GitIndexLock { message, .. } => E::LockBusy(message),
            StorageError::Transient(msg) => E::Transient(msg),
            StorageError::NonFastForward(msg) | StorageError::Sync(msg) => E::Sync(msg),
            StorageError::InvalidPath(msg) => E::Validation(msg),
            StorageError::NotInitialized => E::Internal("repository not initialized".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_public_taxonomy() {
        let cases: Vec<(StorageError, &str)> = vec![
            (StorageError::LockBusy("held".into()), "LOCK_BUSY"),
            (StorageError::Transient("net".into()), "TRANSIENT"),
            (StorageError::NonFastForward("rejected".into()), "SYNC_ERROR"),
            (StorageError::Sync("x".into()), "SYNC_ERROR"),
            (StorageError::InvalidPath("..".into()), "VALIDATION_ERROR"),
            (StorageError::NotInitialized, "UNHANDLED_EXCEPTION"),
            (
                StorageError::Git(git2::Error::from_str("boom")),
                "GIT_ERROR",
            ),
        ];
        for (err, code) in cases {
            let mapped: taskvault_core::Error = err.into();
            assert_eq!(mapped.error_type(), code);
        }
    }
}
