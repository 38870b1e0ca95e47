//! One synchronisation cycle: fetch, integrate, push.

use std::sync::Mutex;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use git2::Oid;
use serde::Serialize;
use taskvault_core::Config;
use taskvault_core::config::redact_remote_url;

use crate::commit_log::{
    CommitLog, RecordChange, changed_paths, commit_tree, deletion_time, read_blob,
};
use crate::lock::RepositoryLock;
use crate::resolver::{Candidate, ConflictResolver, Merge, ResolutionNote};
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// No remote is configured; nothing to do.
    NoRemote,
    UpToDate,
    /// Only local commits were new.
    Pushed,
    /// Only remote commits were new.
    FastForwarded,
    /// Both sides had new commits; a merge commit was pushed.
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub attempts: u32,
    /// Divergence observed before integrating, on the first attempt.
    pub commits_ahead: usize,
    pub commits_behind: usize,
    /// Record paths decided by the merge commit.
    pub reconciled: usize,
    pub merge_commit: Option<String>,
    pub notes: Vec<ResolutionNote>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub commits_ahead: usize,
    pub commits_behind: usize,
    /// Whether the background scheduler is active.
    pub running: bool,
    pub interval_minutes: u64,
    pub remote_url: Option<String>,
    pub last_report: Option<SyncReport>,
}

#[cfg(test)]
type PushHook = Box<dyn FnMut() + Send>;

pub struct SyncEngine {
    log: CommitLog,
    lock: RepositoryLock,
    resolver: ConflictResolver,
    max_retries: u32,
    status: Mutex<SyncStatus>,
    #[cfg(test)]
    before_push: Mutex<Option<PushHook>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("root", &self.log.root())
            .field("lock", &self.lock)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(log: CommitLog, lock: RepositoryLock, config: &Config) -> Self {
        let status = SyncStatus {
            interval_minutes: config.auto_sync_interval_minutes,
            ..SyncStatus::default()
        };
        Self {
            log,
            lock,
            resolver: ConflictResolver::new(),
            max_retries: config.sync_max_retries,
            status: Mutex::new(status),
            #[cfg(test)]
            before_push: Mutex::new(None),
        }
    }

    /// Run one cycle and record its result in the status. Failures are
    /// logged and returned, never retried here.
    pub fn sync_now(&self) -> taskvault_core::Result<SyncReport> {
        let result = self.run_cycle();
        let (ahead, behind) = self.current_divergence().unwrap_or_default();

        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.commits_ahead = ahead;
        status.commits_behind = behind;
        match &result {
            Ok(report) => {
                status.last_sync_at = Some(report.finished_at);
                status.last_error = None;
                status.last_report = Some(report.clone());
                tracing::info!(
                    outcome = ?report.outcome,
                    attempts = report.attempts,
                    reconciled = report.reconciled,
                    "[sync] cycle finished"
                );
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                tracing::warn!("[sync] cycle failed: {e}");
            }
        }
        drop(status);
        result.map_err(Into::into)
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        status.remote_url = self
            .log
            .remote_url()
            .ok()
            .flatten()
            .map(|url| redact_remote_url(&url));
        status
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).running = running;
    }

    pub(crate) fn set_cancelled(&self, cancelled: bool) {
        self.log.cancel_handle().store(cancelled, Ordering::Relaxed);
    }

    /// Run `hook` between integrating and pushing, on every attempt.
    #[cfg(test)]
    pub(crate) fn set_before_push(&self, hook: impl FnMut() + Send + 'static) {
        *self.before_push.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    #[cfg(test)]
    fn run_before_push(&self) {
        if let Some(hook) = self
            .before_push
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            hook();
        }
    }

    /// Local head against the last fetched remote tip.
    fn current_divergence(&self) -> Result<(usize, usize)> {
        match (self.log.head_oid()?, self.log.remote_tip()?) {
            (Some(local), Some(remote)) => self.log.ahead_behind(local, remote),
            (Some(local), None) if self.log.has_remote()? => {
                Ok((self.log.count_commits(local)?, 0))
            }
            _ => Ok((0, 0)),
        }
    }

    fn run_cycle(&self) -> Result<SyncReport> {
        let started_at = Utc::now();
        let mut report = SyncReport {
            outcome: SyncOutcome::NoRemote,
            attempts: 0,
            commits_ahead: 0,
            commits_behind: 0,
            reconciled: 0,
            merge_commit: None,
            notes: Vec::new(),
            started_at,
            finished_at: started_at,
        };
        if !self.log.has_remote()? {
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let _guard = self.lock.acquire()?;
        loop {
            report.attempts += 1;
            let remote_tip = self.log.fetch()?;
            let local = self.log.head_oid()?.ok_or(StorageError::NotInitialized)?;

            let (ahead, behind) = match remote_tip {
                Some(remote) => self.log.ahead_behind(local, remote)?,
                None => (self.log.count_commits(local)?, 0),
            };
            if report.attempts == 1 {
                report.commits_ahead = ahead;
                report.commits_behind = behind;
            }
            tracing::debug!(attempt = report.attempts, ahead, behind, "[sync] fetched");

            match remote_tip {
                Some(remote) if remote == local => {
                    report.outcome = SyncOutcome::UpToDate;
                    break;
                }
                Some(remote) if ahead == 0 => {
                    self.log.fast_forward(remote)?;
                    report.outcome = SyncOutcome::FastForwarded;
                    break;
                }
                Some(remote) if behind > 0 => {
                    let (merge, reconciled, notes) = self.reconcile(local, remote)?;
                    report.outcome = SyncOutcome::Reconciled;
                    report.reconciled = reconciled;
                    report.merge_commit = Some(merge.to_string());
                    // Earlier attempts' merges stay in history; keep their notes.
                    report.notes.extend(notes);
                }
                _ => report.outcome = SyncOutcome::Pushed,
            }

            #[cfg(test)]
            self.run_before_push();

            match self.log.push() {
                Ok(()) => break,
                Err(StorageError::NonFastForward(msg)) if report.attempts <= self.max_retries => {
                    tracing::warn!(
                        attempt = report.attempts,
                        "[sync] push rejected, fetching again: {msg}"
                    );
                }
                Err(StorageError::NonFastForward(msg)) => {
                    return Err(StorageError::Sync(format!(
                        "push still rejected after {} attempts: {msg}",
                        report.attempts
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Merge diverged histories: start from the remote tree, carry over every
    /// path only the local side changed, and resolve paths both changed.
    fn reconcile(&self, local: Oid, remote: Oid) -> Result<(Oid, usize, Vec<ResolutionNote>)> {
        let base = self.log.merge_base(local, remote)?;
        let repo = self.log.repo()?;
        let base_tree = base.map(|oid| commit_tree(&repo, oid)).transpose()?;
        let local_tree = commit_tree(&repo, local)?;
        let remote_tree = commit_tree(&repo, remote)?;

        let local_changed = changed_paths(&repo, base_tree.as_ref(), &local_tree)?;
        let remote_changed = changed_paths(&repo, base_tree.as_ref(), &remote_tree)?;

        let mut changes = Vec::new();
        let mut notes = Vec::new();
        for path in &local_changed {
            let mine = read_blob(&repo, Some(&local_tree), path)?;
            if !remote_changed.contains(path) {
                changes.push(RecordChange {
                    path: path.clone(),
                    content: mine,
                });
                continue;
            }

            let theirs = read_blob(&repo, Some(&remote_tree), path)?;
            let ancestor = read_blob(&repo, base_tree.as_ref(), path)?;
            match ConflictResolver::classify(ancestor.as_deref(), mine.as_deref(), theirs.as_deref())
            {
                Merge::TakeRemote => {}
                Merge::TakeLocal => {
                    if mine != theirs {
                        changes.push(RecordChange {
                            path: path.clone(),
                            content: mine,
                        });
                    }
                }
                Merge::Conflict => {
                    let local_candidate = match mine {
                        Some(bytes) => Candidate::present(bytes),
                        None => Candidate::deleted(deletion_time(&repo, local, base, path)?),
                    };
                    let remote_candidate = match theirs.clone() {
                        Some(bytes) => Candidate::present(bytes),
                        None => Candidate::deleted(deletion_time(&repo, remote, base, path)?),
                    };
                    let resolution = self.resolver.resolve(path, local_candidate, remote_candidate);
                    if resolution.content != theirs {
                        changes.push(RecordChange {
                            path: path.clone(),
                            content: resolution.content,
                        });
                    }
                    notes.push(resolution.note);
                }
            }
        }
        drop((base_tree, local_tree, remote_tree));
        drop(repo);

        let reconciled = local_changed.len();
        let mut message = format!("Reconcile: {reconciled} record(s)");
        if !notes.is_empty() {
            let lines: Vec<String> = notes
                .iter()
                .map(|note| format!("{}: {}", note.path, note.detail))
                .collect();
            message = format!("{message}\n\n{}\n", lines.join("\n"));
        }
        let merge = self.log.rebase_onto_remote(local, remote, &changes, &message)?;
        tracing::info!(
            %merge,
            reconciled,
            conflicts = notes.len(),
            "[sync] reconciled diverged histories"
        );
        Ok((merge, reconciled, notes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{OpenOptions, RepositoryStore};
    use crate::store::RecordStore;
    use taskvault_core::{ListFilter, NewTask};
    use taskvault_test_helpers::{TestRemote, writer_config};
    use tempfile::TempDir;

    /// A writer that pushes to `remote` whenever it is poked.
    struct Interloper {
        _dir: TempDir,
        store: RepositoryStore,
        pushes: usize,
    }

    impl Interloper {
        fn new(remote: &TestRemote) -> Self {
            let dir = TempDir::new().unwrap();
            let store =
                RepositoryStore::open_with(writer_config(remote, dir.path()), OpenOptions::manual())
                    .unwrap();
            store.sync_now().unwrap();
            Self {
                _dir: dir,
                store,
                pushes: 0,
            }
        }

        fn push_one(&mut self) {
            self.pushes += 1;
            self.store
                .create_task(NewTask::named(format!("interloper {}", self.pushes)))
                .unwrap();
            assert_eq!(self.store.sync_now().unwrap().outcome, SyncOutcome::Pushed);
        }
    }

    fn local_writer(
        remote: &TestRemote,
        dir: &TempDir,
        max_retries: u32,
    ) -> (RecordStore, SyncEngine) {
        let config = Config {
            sync_max_retries: max_retries,
            ..writer_config(remote, dir.path())
        };
        let log = CommitLog::open_or_init(&config).unwrap();
        let lock = RepositoryLock::for_git_dir(&log.git_dir());
        let records = RecordStore::new(log.clone(), lock.clone());
        (records, SyncEngine::new(log, lock, &config))
    }

    #[test]
    fn rejected_push_is_fetched_reconciled_and_retried() {
        let remote = TestRemote::new();
        let mut other = Interloper::new(&remote);
        let dir = TempDir::new().unwrap();
        let (records, engine) = local_writer(&remote, &dir, 3);
        records.create_task(NewTask::named("mine")).unwrap();

        let mut remaining = 1;
        engine.set_before_push(move || {
            if remaining > 0 {
                remaining -= 1;
                other.push_one();
            }
        });

        let report = engine.sync_now().unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.outcome, SyncOutcome::Reconciled);
        assert_eq!((report.commits_ahead, report.commits_behind), (1, 0));
        assert!(report.notes.is_empty());

        let head = engine.log.head_oid().unwrap();
        assert_eq!(remote.tip("main"), head);
        let status = engine.status();
        assert_eq!(status.last_error, None);
        assert_eq!((status.commits_ahead, status.commits_behind), (0, 0));
    }

    #[test]
    fn exhausted_retry_budget_surfaces_sync_error() {
        let remote = TestRemote::new();
        let mut other = Interloper::new(&remote);
        let dir = TempDir::new().unwrap();
        let (records, engine) = local_writer(&remote, &dir, 0);
        records.create_task(NewTask::named("mine")).unwrap();
        engine.set_before_push(move || other.push_one());

        let err = engine.sync_now().unwrap_err();
        assert_eq!(err.error_type(), "SYNC_ERROR");
        assert!(!err.is_retryable());
        let last_error = engine.status().last_error.unwrap();
        assert!(last_error.contains("after 1 attempts"), "{last_error}");

        // The local mutation is untouched and a later cycle gets through.
        assert_eq!(records.list_tasks(&ListFilter::default()).unwrap().len(), 1);
        engine.set_before_push(|| {});
        assert_eq!(engine.sync_now().unwrap().outcome, SyncOutcome::Reconciled);
    }
}
