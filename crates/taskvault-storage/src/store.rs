//! CRUD over task and project record files.
//!
//! Reads never take the repository lock: every write is an atomic rename, so
//! a reader sees either the old or the new file. Mutations hold the lock from
//! the first file write until the commit lands, and undo the file change if
//! the commit fails.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taskvault_core::models::{
    format_timestamp, generate_task_id, next_stamp, now_micros, project_key, validate_record_id,
};
use taskvault_core::{
    Error, ListFilter, NewProject, NewTask, Project, ProjectPatch, ProjectSummary, Result, Task,
    TaskPatch, TaskStats, TaskStatus,
};

use crate::commit_log::{CommitLog, DELETED_AT_TRAILER, RECORD_TRAILER, append_trailers};
use crate::fsutil::{TMP_PREFIX, atomic_write_bytes, ensure_parent_dir, remove_file_if_exists};
use crate::lock::RepositoryLock;
use crate::{PROJECTS_DIR, StorageError, TASKS_DIR};

/// Called after every successful mutation.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

const MAX_ID_DRAWS: usize = 8;

/// A data-integrity problem found while listing. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityWarning {
    CorruptRecord {
        path: PathBuf,
        reason: String,
    },
    DanglingParent {
        task_id: String,
        parent_task_id: String,
    },
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptRecord { path, reason } => {
                write!(f, "skipped corrupt record {}: {reason}", path.display())
            }
            Self::DanglingParent {
                task_id,
                parent_task_id,
            } => write!(f, "task {task_id} references missing parent {parent_task_id}"),
        }
    }
}

/// A filtered snapshot of the task files, ordered by `created_at` then id.
///
/// `iter()` can be called any number of times; each call starts over.
#[derive(Debug, Clone, Default)]
pub struct TaskListing {
    tasks: Vec<Task>,
    warnings: Vec<IntegrityWarning>,
}

impl TaskListing {
    pub fn iter(&self) -> TaskIter<'_> {
        TaskIter {
            inner: self.tasks.iter(),
        }
    }

    pub fn warnings(&self) -> &[IntegrityWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

impl<'a> IntoIterator for &'a TaskListing {
    type Item = &'a Task;
    type IntoIter = TaskIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct TaskIter<'a> {
    inner: std::slice::Iter<'a, Task>,
}

impl<'a> Iterator for TaskIter<'a> {
    type Item = &'a Task;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for TaskIter<'_> {}

pub struct RecordStore {
    log: CommitLog,
    lock: RepositoryLock,
    on_change: Option<ChangeHook>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("root", &self.log.root())
            .field("lock", &self.lock)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

impl RecordStore {
    pub const fn new(log: CommitLog, lock: RepositoryLock) -> Self {
        Self {
            log,
            lock,
            on_change: None,
        }
    }

    pub fn set_change_hook(&mut self, hook: ChangeHook) {
        self.on_change = Some(hook);
    }

    pub fn root(&self) -> &Path {
        self.log.root()
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        new.validate()?;
        let _guard = self.lock.acquire()?;

        if let Some(parent) = &new.parent_task_id {
            self.check_parent(None, parent)?;
        }

        let id = self.fresh_task_id()?;
        let task = Task::from_new(id, new, now_micros())?;
        let rel = task_rel_path(&task.id);
        let message = format!(
            "Create task: {} ({})",
            task.task_name,
            task.project_path.as_deref().unwrap_or("default")
        );
        self.write_and_commit(&rel, Some(&record_bytes(&task)?), &message, &[])?;
        tracing::info!(id = %task.id, "[store] created task");
        Ok(task)
    }

    pub fn read_task(&self, id: &str) -> Result<Task> {
        validate_record_id(id)?;
        let path = self.root().join(task_rel_path(id));
        let task: Task = read_record(&path)?.ok_or_else(|| Error::task_not_found(id))?;
        if task.id != id {
            return Err(corrupt(&path, format!("file holds task {}", task.id)));
        }
        if !task.completion_consistent() {
            return Err(corrupt(&path, "completed_at does not match status"));
        }
        Ok(task)
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        patch.validate()?;
        let _guard = self.lock.acquire()?;

        let mut task = self.read_task(id)?;
        if let Some(Some(parent)) = &patch.parent_task_id {
            self.check_parent(Some(id), parent)?;
        }

        let change = task.apply_patch(patch, now_micros())?;
        let message = match change {
            Some(change) if change.to == TaskStatus::Completed => {
                match task.completion_report.as_deref().map(str::trim) {
                    Some(report) if !report.is_empty() => {
                        format!("Complete task: {}\n\n{report}", task.task_name)
                    }
                    _ => format!("Complete task: {}", task.task_name),
                }
            }
            Some(change) => format!("Update task status: {} → {}", task.task_name, change.to),
            None => format!("Update task: {}", task.task_name),
        };

        let rel = task_rel_path(id);
        self.write_and_commit(&rel, Some(&record_bytes(&task)?), &message, &[])?;
        tracing::info!(id, status = %task.status, "[store] updated task");
        Ok(task)
    }

    /// Remove a task. Subtasks are kept and their parent reference dangles.
    pub fn delete_task(&self, id: &str) -> Result<()> {
        validate_record_id(id)?;
        let _guard = self.lock.acquire()?;

        let (name, previous_stamp) = match self.read_task(id) {
            Ok(task) => (task.task_name, Some(task.updated_at)),
            Err(Error::CorruptRecord { .. }) => (id.to_string(), None),
            Err(e) => return Err(e),
        };
        let now = now_micros();
        let deleted_at = previous_stamp.map_or(now, |prev| next_stamp(prev, now));

        let rel = task_rel_path(id);
        self.write_and_commit(
            &rel,
            None,
            &format!("Delete task: {name}"),
            &[(DELETED_AT_TRAILER, format_timestamp(&deleted_at))],
        )?;
        tracing::info!(id, "[store] deleted task");
        Ok(())
    }

    pub fn list_tasks(&self, filter: &ListFilter) -> Result<TaskListing> {
        let (all, mut warnings) = self.scan_tasks()?;

        let ids: HashSet<&str> = all.iter().map(|t| t.id.as_str()).collect();
        for task in &all {
            if let Some(parent) = &task.parent_task_id
                && !ids.contains(parent.as_str())
            {
                warnings.push(IntegrityWarning::DanglingParent {
                    task_id: task.id.clone(),
                    parent_task_id: parent.clone(),
                });
            }
        }

        let mut tasks: Vec<Task> = all.into_iter().filter(|t| filter.matches(t)).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(TaskListing { tasks, warnings })
    }

    /// Tasks whose `parent_task_id` is `id`.
    pub fn subtasks(&self, id: &str) -> Result<Vec<Task>> {
        self.read_task(id)?;
        Ok(self
            .list_tasks(&ListFilter::default().parent(id))?
            .into_tasks())
    }

    pub fn task_stats(&self, project_path: Option<&str>) -> Result<TaskStats> {
        let mut filter = ListFilter::default();
        if let Some(project) = project_path {
            filter = filter.project(project);
        }
        let mut stats = TaskStats::default();
        for task in &self.list_tasks(&filter)? {
            stats.record(task.status);
        }
        Ok(stats)
    }

    /// Parent must exist and be top-level; a task that has subtasks cannot
    /// itself become a subtask.
    fn check_parent(&self, child: Option<&str>, parent_id: &str) -> Result<()> {
        if child == Some(parent_id) {
            return Err(Error::validation("a task cannot be its own parent"));
        }
        let parent = match self.read_task(parent_id) {
            Ok(parent) => parent,
            Err(Error::NotFound { .. }) => {
                return Err(Error::validation(format!(
                    "parent task {parent_id} does not exist"
                )));
            }
            Err(e) => return Err(e),
        };
        if parent.parent_task_id.is_some() {
            return Err(Error::validation(format!(
                "parent task {parent_id} is itself a subtask; nesting is limited to one level"
            )));
        }
        if let Some(child) = child {
            let (all, _) = self.scan_tasks()?;
            if all
                .iter()
                .any(|t| t.parent_task_id.as_deref() == Some(child))
            {
                return Err(Error::validation(format!(
                    "task {child} has subtasks and cannot become a subtask"
                )));
            }
        }
        Ok(())
    }

    fn fresh_task_id(&self) -> Result<String> {
        for _ in 0..MAX_ID_DRAWS {
            let id = generate_task_id()?;
            if !self.root().join(task_rel_path(&id)).exists() {
                return Ok(id);
            }
        }
        Err(Error::Internal("could not draw an unused task id".into()))
    }

    fn scan_tasks(&self) -> Result<(Vec<Task>, Vec<IntegrityWarning>)> {
        let mut tasks = Vec::new();
        let mut warnings = Vec::new();
        for path in record_files(&self.root().join(TASKS_DIR))? {
            let expected_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            match self.read_task(&expected_id) {
                Ok(task) => tasks.push(task),
                // Removed between the directory scan and the read.
                Err(Error::NotFound { .. }) => {}
                Err(Error::CorruptRecord { path, reason }) => {
                    tracing::warn!("[store] skipping corrupt record {}: {reason}", path.display());
                    warnings.push(IntegrityWarning::CorruptRecord { path, reason });
                }
                Err(Error::Validation(reason)) => {
                    tracing::warn!("[store] skipping unexpected file {}: {reason}", path.display());
                    warnings.push(IntegrityWarning::CorruptRecord { path, reason });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((tasks, warnings))
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        let project = new.into_project(now_micros())?;
        let _guard = self.lock.acquire()?;

        let rel = project_rel_path(&project.project_path);
        if self.root().join(&rel).exists() {
            return Err(Error::validation(format!(
                "project {} already exists",
                project.project_path
            )));
        }
        self.write_and_commit(
            &rel,
            Some(&record_bytes(&project)?),
            &format!("Create project: {}", project.project_name),
            &[],
        )?;
        tracing::info!(project = %project.project_path, "[store] created project");
        Ok(project)
    }

    pub fn read_project(&self, project_path: &str) -> Result<Project> {
        let path = self.root().join(project_rel_path(project_path));
        let project: Project =
            read_record(&path)?.ok_or_else(|| Error::project_not_found(project_path))?;
        if project.project_path != project_path {
            return Err(Error::project_not_found(project_path));
        }
        Ok(project)
    }

    pub fn update_project(&self, project_path: &str, patch: ProjectPatch) -> Result<Project> {
        let _guard = self.lock.acquire()?;
        let mut project = self.read_project(project_path)?;
        project.apply_patch(patch, now_micros())?;
        self.write_and_commit(
            &project_rel_path(project_path),
            Some(&record_bytes(&project)?),
            &format!("Update project: {}", project.project_name),
            &[],
        )?;
        Ok(project)
    }

    /// Remove a project file. Tasks keep their `project_path`.
    pub fn delete_project(&self, project_path: &str) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let project = self.read_project(project_path)?;
        let deleted_at = next_stamp(project.updated_at, now_micros());
        self.write_and_commit(
            &project_rel_path(project_path),
            None,
            &format!("Delete project: {}", project.project_name),
            &[(DELETED_AT_TRAILER, format_timestamp(&deleted_at))],
        )?;
        tracing::info!(project = project_path, "[store] deleted project");
        Ok(())
    }

    /// Projects with derived task counts, including paths that only tasks
    /// reference. Sorted by task count (descending), then path.
    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let mut projects: BTreeMap<String, Project> = BTreeMap::new();
        for path in record_files(&self.root().join(PROJECTS_DIR))? {
            match read_record::<Project>(&path) {
                Ok(Some(project)) => {
                    projects.insert(project.project_path.clone(), project);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("[store] skipping project file: {e}"),
            }
        }

        let mut stats: BTreeMap<String, TaskStats> = BTreeMap::new();
        let (tasks, _) = self.scan_tasks()?;
        for task in &tasks {
            if let Some(project) = &task.project_path {
                stats.entry(project.clone()).or_default().record(task.status);
            }
        }
        for path in projects.keys() {
            stats.entry(path.clone()).or_default();
        }

        let mut summaries: Vec<ProjectSummary> = stats
            .into_iter()
            .map(|(path, counts)| {
                let project = projects.get(&path);
                ProjectSummary::new(path, project, counts)
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.task_count
                .cmp(&a.task_count)
                .then_with(|| a.project_path.cmp(&b.project_path))
        });
        Ok(summaries)
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Write (or remove) one record file and commit it, restoring the file
    /// from `HEAD` when either step fails. Callers hold the lock.
    fn write_and_commit(
        &self,
        rel: &str,
        content: Option<&[u8]>,
        message: &str,
        trailers: &[(&str, String)],
    ) -> Result<()> {
        let full = self.root().join(rel);
        let mut all_trailers = vec![(RECORD_TRAILER, rel.to_string())];
        all_trailers.extend(trailers.iter().cloned());
        let message = append_trailers(message, &all_trailers);

        let written = match content {
            Some(bytes) => ensure_parent_dir(&full)
                .map_err(StorageError::from)
                .and_then(|()| atomic_write_bytes(&full, bytes)),
            None => remove_file_if_exists(&full)
                .map(|_| ())
                .map_err(StorageError::from),
        };
        let outcome = written.and_then(|()| self.log.commit(&message, &[rel]));

        match outcome {
            Ok(_) => {
                if let Some(hook) = &self.on_change {
                    hook();
                }
                Ok(())
            }
            Err(err) => {
                if let Err(restore_err) = self.log.restore_paths(&[rel]) {
                    tracing::warn!("[store] failed to roll back {rel}: {restore_err}");
                }
                Err(err.into())
            }
        }
    }
}

fn task_rel_path(id: &str) -> String {
    format!("{TASKS_DIR}/{id}.json")
}

fn project_rel_path(project_path: &str) -> String {
    format!("{PROJECTS_DIR}/{}.json", project_key(project_path))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::CorruptRecord {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn record_bytes<T: serde::Serialize>(record: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(record)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a record file; `None` when the file does not exist.
fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| corrupt(path, e.to_string()))
}

/// `*.json` files directly inside `dir`, skipping in-flight temp files.
fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(TMP_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskvault_core::Config;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RecordStore {
        let config = Config {
            repo_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let log = CommitLog::open_or_init(&config).unwrap();
        let lock = RepositoryLock::for_git_dir(&log.git_dir());
        RecordStore::new(log, lock)
    }

    fn head_message(store: &RecordStore) -> String {
        let repo = store.log.repo().unwrap();
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        commit.message().unwrap().to_string()
    }

    #[test]
    fn create_writes_file_and_commits() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = store
            .create_task(NewTask::named("Implement X").with_status(TaskStatus::Pending))
            .unwrap();

        assert!(task.id.starts_with("t-"));
        assert_eq!(task.completed_at, None);
        assert_eq!(task.created_at, task.updated_at);
        assert!(dir.path().join(format!("tasks/{}.json", task.id)).is_file());
        let message = head_message(&store);
        assert!(message.starts_with("Create task: Implement X (default)\n\n"));
        assert!(message.contains(&format!("Record: tasks/{}.json", task.id)));
        assert_eq!(store.read_task(&task.id).unwrap(), task);
    }

    #[test]
    fn update_messages_follow_status_transitions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = store.create_task(NewTask::named("Write docs")).unwrap();

        store
            .update_task(&task.id, TaskPatch::status(TaskStatus::InProgress))
            .unwrap();
        assert!(head_message(&store).starts_with("Update task status: Write docs → in_progress"));

        let done = store
            .update_task(&task.id, TaskPatch::complete(Some("shipped".into())))
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(head_message(&store).starts_with("Complete task: Write docs\n\nshipped"));

        let patch = TaskPatch {
            priority: Some(3),
            ..TaskPatch::default()
        };
        let bumped = store.update_task(&task.id, patch).unwrap();
        assert!(bumped.updated_at > done.updated_at);
        assert!(head_message(&store).starts_with("Update task: Write docs"));
    }

    #[test]
    fn delete_writes_tombstone_trailer() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = store.create_task(NewTask::named("Temp")).unwrap();
        store.delete_task(&task.id).unwrap();

        let message = head_message(&store);
        assert!(message.starts_with("Delete task: Temp"));
        assert!(message.contains("Deleted-At: "));
        assert!(matches!(
            store.read_task(&task.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn corrupt_file_fails_read_but_not_list() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let good = store.create_task(NewTask::named("Good")).unwrap();
        fs::write(dir.path().join("tasks/t-bad.json"), "{ nope").unwrap();

        assert!(matches!(
            store.read_task("t-bad"),
            Err(Error::CorruptRecord { .. })
        ));
        let listing = store.list_tasks(&ListFilter::default()).unwrap();
        assert_eq!(listing.iter().map(|t| t.id.clone()).collect::<Vec<_>>(), vec![good.id]);
        assert!(matches!(
            listing.warnings(),
            [IntegrityWarning::CorruptRecord { .. }]
        ));
    }

    #[test]
    fn failed_commit_rolls_back_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = store.create_task(NewTask::named("Keep me")).unwrap();

        // A fresh index.lock makes every commit attempt fail.
        fs::write(dir.path().join(".git/index.lock"), "").unwrap();
        let err = store
            .update_task(&task.id, TaskPatch::status(TaskStatus::Completed))
            .unwrap_err();
        assert_eq!(err.error_type(), "LOCK_BUSY");
        fs::remove_file(dir.path().join(".git/index.lock")).unwrap();

        assert_eq!(store.read_task(&task.id).unwrap(), task);
    }

    #[test]
    fn projects_are_listed_with_implicit_paths() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let project = store
            .create_project(NewProject::named("Task Vault"))
            .unwrap();
        assert_eq!(project.project_path, "task-vault");
        assert!(store.create_project(NewProject::named("Task Vault")).is_err());

        store
            .create_task(NewTask::named("a").with_project("task-vault"))
            .unwrap();
        store
            .create_task(NewTask::named("b").with_project("/srv/other"))
            .unwrap();
        store
            .create_task(NewTask::named("c").with_project("/srv/other"))
            .unwrap();

        let summaries = store.list_projects().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].project_path, "/srv/other");
        assert!(summaries[0].implicit);
        assert_eq!(summaries[0].task_count, 2);
        assert_eq!(summaries[1].project_name.as_deref(), Some("Task Vault"));

        store.delete_project("task-vault").unwrap();
        assert!(matches!(
            store.read_project("task-vault"),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(store.task_stats(Some("task-vault")).unwrap().total, 1);
    }
}
