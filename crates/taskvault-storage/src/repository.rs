//! Lifecycle facade: one opened task repository with its lock, record store,
//! sync engine and (optionally) background scheduler.

use std::sync::Arc;

use taskvault_core::{
    Config, Error, ListFilter, NewProject, NewTask, Project, ProjectPatch, ProjectSummary,
    Result, Task, TaskPatch, TaskStats,
};

use crate::commit_log::CommitLog;
use crate::lock::RepositoryLock;
use crate::scheduler::SyncScheduler;
use crate::store::{RecordStore, TaskListing};
use crate::sync::{SyncEngine, SyncReport, SyncStatus};

/// What [`RepositoryStore::open_with`] starts besides the repository itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub start_scheduler: bool,
    pub sync_on_startup: bool,
    pub sync_on_close: bool,
    pub auto_push_on_change: bool,
}

impl OpenOptions {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            start_scheduler: config.auto_sync_enabled,
            sync_on_startup: config.sync_on_startup,
            sync_on_close: config.sync_on_close,
            auto_push_on_change: config.auto_push_on_change,
        }
    }

    /// No background work at all; sync only when asked.
    #[must_use]
    pub const fn manual() -> Self {
        Self {
            start_scheduler: false,
            sync_on_startup: false,
            sync_on_close: false,
            auto_push_on_change: false,
        }
    }
}

#[derive(Debug)]
pub struct RepositoryStore {
    config: Config,
    records: RecordStore,
    engine: Arc<SyncEngine>,
    scheduler: Option<SyncScheduler>,
    sync_on_close: bool,
    closed: bool,
}

impl RepositoryStore {
    pub fn open(config: Config) -> Result<Self> {
        let options = OpenOptions::from_config(&config);
        Self::open_with(config, options)
    }

    pub fn open_with(config: Config, options: OpenOptions) -> Result<Self> {
        let log = CommitLog::open_or_init(&config)?;
        let lock = RepositoryLock::for_git_dir(&log.git_dir())
            .with_timeout(config.lock_timeout())
            .with_stale_after(config.lock_stale_after())
            .with_holder(format!("taskvault:{}", std::process::id()));

        match lock.heal() {
            Ok(true) => tracing::info!("[lock] reclaimed stale repository lock"),
            Ok(false) => {}
            Err(e) => tracing::warn!("[lock] failed to check for a stale lock: {e}"),
        }
        recover_worktree(&log, &lock);

        let engine = Arc::new(SyncEngine::new(log.clone(), lock.clone(), &config));
        let mut records = RecordStore::new(log, lock);

        let scheduler = if options.start_scheduler {
            let scheduler = SyncScheduler::start(
                Arc::clone(&engine),
                config.sync_interval(),
                options.sync_on_startup,
            )?;
            if options.auto_push_on_change {
                records.set_change_hook(scheduler.trigger_hook());
            }
            Some(scheduler)
        } else {
            if options.sync_on_startup {
                // Recorded in the sync status; startup never fails on sync.
                let _ = engine.sync_now();
            }
            None
        };

        tracing::info!(
            root = %config.repo_path.display(),
            scheduler = scheduler.is_some(),
            "[store] repository opened"
        );
        Ok(Self {
            config,
            records,
            engine,
            scheduler,
            sync_on_close: options.sync_on_close,
            closed: false,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn records(&self) -> &RecordStore {
        &self.records
    }

    // Tasks

    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        self.records.create_task(new)
    }

    pub fn read_task(&self, id: &str) -> Result<Task> {
        self.records.read_task(id)
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.records.update_task(id, patch)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.records.delete_task(id)
    }

    pub fn list_tasks(&self, filter: &ListFilter) -> Result<TaskListing> {
        self.records.list_tasks(filter)
    }

    pub fn subtasks(&self, id: &str) -> Result<Vec<Task>> {
        self.records.subtasks(id)
    }

    pub fn task_stats(&self, project_path: Option<&str>) -> Result<TaskStats> {
        self.records.task_stats(project_path)
    }

    // Projects

    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        self.records.create_project(new)
    }

    pub fn read_project(&self, project_path: &str) -> Result<Project> {
        self.records.read_project(project_path)
    }

    pub fn update_project(&self, project_path: &str, patch: ProjectPatch) -> Result<Project> {
        self.records.update_project(project_path, patch)
    }

    pub fn delete_project(&self, project_path: &str) -> Result<()> {
        self.records.delete_project(project_path)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        self.records.list_projects()
    }

    // Sync

    /// Run a full cycle on the calling thread.
    pub fn sync_now(&self) -> Result<SyncReport> {
        self.engine.sync_now()
    }

    /// Ask the background scheduler for a cycle; a no-op without one.
    pub fn request_sync(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.trigger();
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn set_remote(&self, url: &str) -> Result<()> {
        let log = CommitLog::from_config(&self.config);
        log.set_remote(url).map_err(Error::from)
    }

    /// Stop the scheduler and, if configured, run a final sync.
    pub fn close(mut self) -> Result<Option<SyncReport>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<Option<SyncReport>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        if !self.sync_on_close {
            return Ok(None);
        }
        let has_remote = CommitLog::from_config(&self.config).has_remote()?;
        if !has_remote {
            return Ok(None);
        }
        self.engine.sync_now().map(Some)
    }
}

impl Drop for RepositoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("[store] final sync on close failed: {e}");
        }
    }
}

/// Roll back record files a crashed writer left uncommitted. Skipped while
/// another process holds the lock, since it may be mid-write.
fn recover_worktree(log: &CommitLog, lock: &RepositoryLock) {
    match lock.try_acquire() {
        Ok(Some(_guard)) => {
            if let Err(e) = log.recover_worktree() {
                tracing::warn!("[store] worktree recovery failed: {e}");
            }
        }
        Ok(None) => tracing::debug!("[store] lock held elsewhere, skipping worktree recovery"),
        Err(e) => tracing::warn!("[store] worktree recovery skipped: {e}"),
    }
}
