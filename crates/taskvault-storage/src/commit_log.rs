//! Git operations behind the record store.
//!
//! Every step opens its own `Repository` handle (handles are not `Sync`) and
//! either completes or fails with a typed [`StorageError`]: network problems
//! are `Transient`, a push the remote refuses because it moved is
//! `NonFastForward`, anything else is a hard failure.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use git2::{
    Commit, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository,
    RepositoryInitOptions, Signature, Sort, Status, StatusOptions, Tree,
};
use taskvault_core::Config;
use taskvault_core::models::parse_timestamp;

use crate::fsutil::{
    TMP_PREFIX, atomic_write_bytes, ensure_parent_dir, remove_file_if_exists,
    validate_repo_relative_path,
};
use crate::{PROJECTS_DIR, Result, StorageError, TASKS_DIR};

/// Trailer naming the record file a commit touched.
pub const RECORD_TRAILER: &str = "Record";
/// Trailer carrying the deletion event time of a tombstone commit.
pub const DELETED_AT_TRAILER: &str = "Deleted-At";

const INIT_MESSAGE: &str = "chore: initialize task repository";
const MAX_INDEX_LOCK_RETRIES: usize = 5;

const GITATTRIBUTES: &str = "# Record files\n*.json text eol=lf\n";
const GITIGNORE: &str = "# In-flight atomic writes\n.tmp-*\n";

/// New content for one path in a reconcile commit (`None` deletes it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub path: String,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct CommitLog {
    root: PathBuf,
    branch: String,
    remote_name: String,
    author_name: String,
    author_email: String,
    network_timeout: Duration,
    cancel: Arc<AtomicBool>,
}

impl CommitLog {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.repo_path.clone(),
            branch: config.branch.clone(),
            remote_name: config.remote_name.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            network_timeout: config.network_timeout(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the repository at `config.repo_path`, creating it when missing.
    ///
    /// A fresh repository adopts the remote branch if the remote already has
    /// one; otherwise it gets an initial commit with `.gitattributes` and
    /// `.gitignore`.
    pub fn open_or_init(config: &Config) -> Result<Self> {
        let log = Self::from_config(config);
        fs::create_dir_all(&log.root)?;

        if log.root.join(".git").exists() {
            let repo = log.repo()?;
            log.configure_remote(&repo, config.remote_url.as_deref())?;
            return Ok(log);
        }

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(&log.branch);
        let repo = Repository::init_opts(&log.root, &opts)?;
        log.configure_remote(&repo, config.remote_url.as_deref())?;
        drop(repo);
        tracing::info!(root = %log.root.display(), "[commit] initialized task repository");

        if config.remote_url.is_some() {
            match log.fetch() {
                Ok(Some(remote_tip)) => {
                    log.adopt(remote_tip)?;
                    tracing::info!(
                        remote = %log.remote_name,
                        branch = %log.branch,
                        "[commit] adopted existing remote history"
                    );
                    return Ok(log);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("[commit] initial fetch failed, starting a local history: {e}");
                }
            }
        }

        atomic_write_bytes(&log.root.join(".gitattributes"), GITATTRIBUTES.as_bytes())?;
        atomic_write_bytes(&log.root.join(".gitignore"), GITIGNORE.as_bytes())?;
        log.commit(INIT_MESSAGE, &[".gitattributes", ".gitignore"])?;
        Ok(log)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn repo(&self) -> Result<Repository> {
        Repository::open(&self.root).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                StorageError::NotInitialized
            } else {
                e.into()
            }
        })
    }

    /// Shared flag that aborts in-flight network transfers when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, self.branch)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.author_name, &self.author_email)?)
    }

    // -----------------------------------------------------------------------
    // Remote configuration
    // -----------------------------------------------------------------------

    fn configure_remote(&self, repo: &Repository, url: Option<&str>) -> Result<()> {
        let Some(url) = url else {
            return Ok(());
        };
        match repo.find_remote(&self.remote_name) {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => {
                repo.remote_set_url(&self.remote_name, url)?;
                tracing::info!(remote = %self.remote_name, "[commit] updated remote url");
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                repo.remote(&self.remote_name, url)?;
                tracing::info!(remote = %self.remote_name, "[commit] added remote");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Point the configured remote at `url`, adding it if needed.
    pub fn set_remote(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StorageError::InvalidPath("remote url is empty".into()));
        }
        let repo = self.repo()?;
        self.configure_remote(&repo, Some(url))
    }

    pub fn remote_url(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        match repo.find_remote(&self.remote_name) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_remote(&self) -> Result<bool> {
        Ok(self.remote_url()?.is_some())
    }

    // -----------------------------------------------------------------------
    // Local history
    // -----------------------------------------------------------------------

    pub fn head_oid(&self) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        resolve_head_commit_oid(&repo)
    }

    /// Number of commits reachable from `tip`.
    pub fn count_commits(&self, tip: Oid) -> Result<usize> {
        let repo = self.repo()?;
        let mut walk = repo.revwalk()?;
        walk.push(tip)?;
        let mut count = 0;
        for oid in walk {
            oid?;
            count += 1;
        }
        Ok(count)
    }

    /// Stage `rel_paths` as they are on disk (missing files are removed from
    /// the index) and commit. Returns `None` when nothing changed.
    pub fn commit(&self, message: &str, rel_paths: &[&str]) -> Result<Option<Oid>> {
        let mut last_err_msg: Option<String> = None;

        for attempt in 0..=MAX_INDEX_LOCK_RETRIES {
            let repo = self.repo()?;
            match self.commit_once(&repo, message, rel_paths) {
                Ok(oid) => return Ok(oid),
                Err(StorageError::Git(ref git_err)) if is_git_index_lock_error(git_err) => {
                    last_err_msg = Some(git_err.message().to_string());
                    if attempt == MAX_INDEX_LOCK_RETRIES {
                        break;
                    }
                    // 100ms, 200ms, 400ms, 800ms, 1600ms
                    std::thread::sleep(Duration::from_millis(100 * (1u64 << attempt.min(4))));
                    let _ = try_clean_stale_git_lock(&self.root, Duration::from_secs(60));
                }
                Err(other) => return Err(other),
            }
        }

        Err(StorageError::GitIndexLock {
            message: last_err_msg.unwrap_or_default(),
            lock_path: self.git_dir().join("index.lock"),
            attempts: MAX_INDEX_LOCK_RETRIES,
        })
    }

    fn commit_once(
        &self,
        repo: &Repository,
        message: &str,
        rel_paths: &[&str],
    ) -> Result<Option<Oid>> {
        let workdir = repo.workdir().ok_or(StorageError::NotInitialized)?;
        let sig = self.signature()?;

        let mut index = repo.index()?;
        reset_index_to_head(repo, &mut index)?;
        for path in rel_paths {
            let path = validate_repo_relative_path("commit path", path)?;
            let p = Path::new(path);
            if workdir.join(p).is_file() {
                index.add_path(p)?;
            } else {
                index.remove_path(p)?;
            }
        }

        let tree_oid = index.write_tree()?;
        let parent = resolve_head_commit_oid(repo)?
            .map(|oid| repo.find_commit(oid))
            .transpose()?;
        index.write()?;
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_oid) {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_oid)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        match repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents) {
            Ok(oid) => {
                tracing::debug!(%oid, paths = rel_paths.len(), "[commit] {}", first_line(message));
                Ok(Some(oid))
            }
            Err(err) => {
                try_restore_index(repo);
                Err(err.into())
            }
        }
    }

    /// Put `rel_paths` back to their `HEAD` content (removing files `HEAD`
    /// does not have) and reset their index entries.
    pub fn restore_paths(&self, rel_paths: &[&str]) -> Result<()> {
        let repo = self.repo()?;
        let workdir = repo.workdir().ok_or(StorageError::NotInitialized)?.to_path_buf();
        let head_tree = resolve_head_commit_oid(&repo)?
            .map(|oid| repo.find_commit(oid).and_then(|c| c.tree()))
            .transpose()?;

        for path in rel_paths {
            let path = validate_repo_relative_path("restore path", path)?;
            let full = workdir.join(path);
            match read_blob(&repo, head_tree.as_ref(), path)? {
                Some(content) => {
                    ensure_parent_dir(&full)?;
                    atomic_write_bytes(&full, &content)?;
                }
                None => {
                    remove_file_if_exists(&full)?;
                }
            }
        }

        let mut index = repo.index()?;
        reset_index_to_head(&repo, &mut index)?;
        index.write()?;
        Ok(())
    }

    /// Roll back uncommitted changes to record files, as left by a writer that
    /// crashed between writing and committing, or by a sync interrupted while
    /// advancing the branch. Returns the restored paths.
    pub fn recover_worktree(&self) -> Result<Vec<String>> {
        let dirty = {
            let repo = self.repo()?;
            let mut opts = StatusOptions::new();
            opts.include_untracked(true)
                .recurse_untracked_dirs(true)
                .include_ignored(true)
                .pathspec(TASKS_DIR)
                .pathspec(PROJECTS_DIR);
            let statuses = repo.statuses(Some(&mut opts))?;
            let dirty: Vec<String> = statuses
                .iter()
                .filter(|entry| entry.status() != Status::CURRENT)
                .filter_map(|entry| entry.path().map(str::to_string))
                .collect();
            dirty
        };

        if dirty.is_empty() {
            return Ok(dirty);
        }
        let refs: Vec<&str> = dirty.iter().map(String::as_str).collect();
        self.restore_paths(&refs)?;
        let temp_files = dirty
            .iter()
            .filter(|p| p.rsplit('/').next().is_some_and(|n| n.starts_with(TMP_PREFIX)))
            .count();
        tracing::warn!(
            restored = dirty.len() - temp_files,
            temp_files,
            "[commit] rolled back uncommitted record changes: {}",
            dirty.join(", ")
        );
        Ok(dirty)
    }

    // -----------------------------------------------------------------------
    // Network
    // -----------------------------------------------------------------------

    fn callbacks<'a>(&self, repo: &Repository, deadline: Instant) -> RemoteCallbacks<'a> {
        let cfg = repo.config().ok();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            if allowed.is_ssh_key()
                && let Some(user) = username_from_url
            {
                return git2::Cred::ssh_key_from_agent(user);
            }
            if allowed.is_user_pass_plaintext()
                && let Some(ref cfg) = cfg
                && let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url)
            {
                return Ok(cred);
            }
            git2::Cred::default()
        });

        let cancel = Arc::clone(&self.cancel);
        callbacks.transfer_progress(move |_progress| {
            !cancel.load(Ordering::Relaxed) && Instant::now() < deadline
        });
        let cancel = Arc::clone(&self.cancel);
        callbacks.sideband_progress(move |_data| {
            !cancel.load(Ordering::Relaxed) && Instant::now() < deadline
        });
        callbacks
    }

    fn network_error(&self, op: &str, err: &git2::Error, deadline: Instant) -> StorageError {
        if self.cancelled() {
            return StorageError::Transient(format!("{op} cancelled"));
        }
        if Instant::now() >= deadline {
            return StorageError::Transient(format!(
                "{op} timed out after {}s: {}",
                self.network_timeout.as_secs(),
                err.message()
            ));
        }
        StorageError::Transient(format!("{op} failed: {}", err.message()))
    }

    /// Fetch the configured branch. Returns the remote tip, or `None` when the
    /// remote does not have the branch yet.
    pub fn fetch(&self) -> Result<Option<Oid>> {
        if self.cancelled() {
            return Err(StorageError::Transient("fetch cancelled".into()));
        }
        let repo = self.repo()?;
        let mut remote = repo.find_remote(&self.remote_name).map_err(|_| {
            StorageError::Sync(format!("remote {} is not configured", self.remote_name))
        })?;

        let refspec = format!("+{}:{}", self.branch_ref(), self.tracking_ref());
        let deadline = Instant::now() + self.network_timeout;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(self.callbacks(&repo, deadline));
        remote
            .fetch(&[refspec.as_str()], Some(&mut fo), None)
            .map_err(|e| self.network_error("fetch", &e, deadline))?;

        lookup_ref(&repo, &self.tracking_ref())
    }

    /// Remote tip as of the last fetch.
    pub fn remote_tip(&self) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        lookup_ref(&repo, &self.tracking_ref())
    }

    /// Push the local branch. Rejections because the remote moved surface as
    /// `NonFastForward` so the caller can fetch and reconcile again.
    pub fn push(&self) -> Result<()> {
        if self.cancelled() {
            return Err(StorageError::Transient("push cancelled".into()));
        }
        let repo = self.repo()?;
        let mut remote = repo.find_remote(&self.remote_name).map_err(|_| {
            StorageError::Sync(format!("remote {} is not configured", self.remote_name))
        })?;
        let refspec = format!("{}:{}", self.branch_ref(), self.branch_ref());
        let deadline = Instant::now() + self.network_timeout;
        let rejected: RefCell<Option<String>> = RefCell::new(None);

        {
            let mut callbacks = self.callbacks(&repo, deadline);
            callbacks.push_update_reference(|_ref_name, status| {
                if let Some(msg) = status {
                    *rejected.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(callbacks);

            if let Err(e) = remote.push(&[refspec.as_str()], Some(&mut push_options)) {
                if is_non_fast_forward(&e) {
                    return Err(StorageError::NonFastForward(e.message().to_string()));
                }
                return Err(self.network_error("push", &e, deadline));
            }
        }

        if let Some(msg) = rejected.into_inner() {
            if is_non_fast_forward_message(&msg) {
                return Err(StorageError::NonFastForward(msg));
            }
            return Err(StorageError::Sync(format!("push rejected: {msg}")));
        }

        if let Some(head) = resolve_head_commit_oid(&repo)? {
            repo.reference(&self.tracking_ref(), head, true, "taskvault: push")?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Integration
    // -----------------------------------------------------------------------

    /// `(ahead, behind)` of `local` relative to `remote`.
    pub fn ahead_behind(&self, local: Oid, remote: Oid) -> Result<(usize, usize)> {
        let repo = self.repo()?;
        Ok(repo.graph_ahead_behind(local, remote)?)
    }

    pub fn merge_base(&self, a: Oid, b: Oid) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        match repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the branch (and working tree) forward to `target`.
    pub fn fast_forward(&self, target: Oid) -> Result<()> {
        let repo = self.repo()?;
        let changed = self.advance_branch(&repo, target, "taskvault: fast-forward")?;
        tracing::debug!(%target, files = changed, "[commit] fast-forwarded");
        Ok(())
    }

    fn adopt(&self, target: Oid) -> Result<()> {
        let repo = self.repo()?;
        self.advance_branch(&repo, target, "taskvault: adopt remote")?;
        Ok(())
    }

    /// Point the branch, index and working tree at `target`. Returns the
    /// number of files touched.
    ///
    /// Files are replaced by atomic rename, never rewritten in place, so an
    /// unlocked reader sees either the old or the new record. The ref moves
    /// first; files a crash leaves behind are then dirty against the new
    /// `HEAD` and [`Self::recover_worktree`] completes the move.
    fn advance_branch(&self, repo: &Repository, target: Oid, reflog: &str) -> Result<usize> {
        let workdir = repo.workdir().ok_or(StorageError::NotInitialized)?.to_path_buf();
        let from = resolve_head_commit_oid(repo)?
            .map(|oid| commit_tree(repo, oid))
            .transpose()?;
        let to = commit_tree(repo, target)?;
        let paths = changed_paths(repo, from.as_ref(), &to)?;

        repo.reference(&self.branch_ref(), target, true, reflog)?;
        repo.set_head(&self.branch_ref())?;
        let mut index = repo.index()?;
        index.read_tree(&to)?;
        index.write()?;

        for path in &paths {
            let path = validate_repo_relative_path("checkout path", path)?;
            let full = workdir.join(path);
            match read_blob(repo, Some(&to), path)? {
                Some(content) => {
                    ensure_parent_dir(&full)?;
                    atomic_write_bytes(&full, &content)?;
                }
                None => {
                    remove_file_if_exists(&full)?;
                }
            }
        }
        Ok(paths.len())
    }

    /// Commit `changes` on top of the remote tree as a merge of `remote`
    /// (first parent) and `local`, then move the branch to it. The result is
    /// a descendant of the remote tip, so the following push fast-forwards.
    pub fn rebase_onto_remote(
        &self,
        local: Oid,
        remote: Oid,
        changes: &[RecordChange],
        message: &str,
    ) -> Result<Oid> {
        let repo = self.repo()?;
        let remote_commit = repo.find_commit(remote)?;
        let local_commit = repo.find_commit(local)?;

        let mut updates = Vec::with_capacity(changes.len());
        for change in changes {
            let path = validate_repo_relative_path("merge path", &change.path)?;
            let blob = change
                .content
                .as_deref()
                .map(|bytes| repo.blob(bytes))
                .transpose()?;
            updates.push((path.to_string(), blob));
        }
        let base_tree = remote_commit.tree()?;
        let tree_oid = build_tree_with_updates(&repo, Some(&base_tree), &updates)?;
        let tree = repo.find_tree(tree_oid)?;

        let sig = self.signature()?;
        let oid = repo.commit(
            None,
            &sig,
            &sig,
            message,
            &tree,
            &[&remote_commit, &local_commit],
        )?;
        self.advance_branch(&repo, oid, "taskvault: reconcile")?;
        tracing::debug!(%oid, changes = changes.len(), "[commit] {}", first_line(message));
        Ok(oid)
    }
}

// ---------------------------------------------------------------------------
// Tree and history helpers
// ---------------------------------------------------------------------------

fn lookup_ref(repo: &Repository, name: &str) -> Result<Option<Oid>> {
    match repo.refname_to_id(name) {
        Ok(oid) => Ok(Some(oid)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn commit_tree(repo: &Repository, oid: Oid) -> Result<Tree<'_>> {
    Ok(repo.find_commit(oid)?.tree()?)
}

/// Content of `path` in `tree`, or `None` when absent.
pub fn read_blob(repo: &Repository, tree: Option<&Tree<'_>>, path: &str) -> Result<Option<Vec<u8>>> {
    let Some(tree) = tree else {
        return Ok(None);
    };
    match tree.get_path(Path::new(path)) {
        Ok(entry) => {
            let blob = repo.find_blob(entry.id())?;
            Ok(Some(blob.content().to_vec()))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// File paths that differ between `base` (empty when `None`) and `tip`.
pub fn changed_paths(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    tip: &Tree<'_>,
) -> Result<BTreeSet<String>> {
    let diff = repo.diff_tree_to_tree(base, Some(tip), None)?;
    let mut paths = BTreeSet::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            if let Some(path) = file.path().and_then(Path::to_str) {
                paths.insert(path.to_string());
            }
        }
    }
    Ok(paths)
}

/// When `path` was deleted on the history from `base` to `tip`.
///
/// The deleting commit is the newest one lacking `path` whose parents all
/// had it. Its `Deleted-At` trailer is preferred over its commit time.
pub fn deletion_time(
    repo: &Repository,
    tip: Oid,
    base: Option<Oid>,
    path: &str,
) -> Result<Option<DateTime<Utc>>> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    walk.push(tip)?;
    if let Some(base) = base {
        walk.hide(base)?;
    }

    let p = Path::new(path);
    for oid in walk {
        let commit = repo.find_commit(oid?)?;
        if commit.tree()?.get_path(p).is_ok() || commit.parent_count() == 0 {
            continue;
        }
        let all_parents_had = commit
            .parents()
            .all(|parent| parent.tree().is_ok_and(|t| t.get_path(p).is_ok()));
        if !all_parents_had {
            continue;
        }
        let stamp = commit
            .message()
            .and_then(|m| trailer_value(m, DELETED_AT_TRAILER))
            .and_then(parse_timestamp)
            .or_else(|| Utc.timestamp_opt(commit.time().seconds(), 0).single());
        return Ok(stamp);
    }
    Ok(None)
}

/// Value of the last `Key: value` trailer line in `message`.
pub fn trailer_value<'m>(message: &'m str, key: &str) -> Option<&'m str> {
    message.lines().rev().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// Append `Key: value` trailers after a blank line.
pub fn append_trailers(message: &str, trailers: &[(&str, String)]) -> String {
    if trailers.is_empty() {
        return message.to_string();
    }
    let body = message.trim_end();
    let lines: Vec<String> = trailers
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect();
    format!("{body}\n\n{}\n", lines.join("\n"))
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

/// Recursively build a git tree with updates applied to the base tree.
///
/// `None` removes an entry; subtrees left empty are dropped.
fn build_tree_with_updates(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    updates: &[(String, Option<Oid>)],
) -> Result<Oid> {
    let mut direct_entries: Vec<(&str, Option<Oid>)> = Vec::new();
    let mut by_prefix: BTreeMap<&str, Vec<(String, Option<Oid>)>> = BTreeMap::new();

    for (path, oid) in updates {
        if let Some((prefix, rest)) = path.split_once('/') {
            by_prefix
                .entry(prefix)
                .or_default()
                .push((rest.to_string(), *oid));
        } else {
            direct_entries.push((path.as_str(), *oid));
        }
    }

    let mut builder = repo.treebuilder(base)?;

    for (name, oid) in direct_entries {
        match oid {
            Some(oid) => builder.insert(name, oid, 0o100_644).map(|_| ())?,
            None if builder.get(name)?.is_some() => builder.remove(name)?,
            None => {}
        }
    }

    for (prefix, sub_updates) in &by_prefix {
        let sub_tree = base
            .and_then(|t| t.get_name(prefix))
            .filter(|e| e.kind() == Some(git2::ObjectType::Tree))
            .map(|e| repo.find_tree(e.id()))
            .transpose()?;

        let new_sub_oid = build_tree_with_updates(repo, sub_tree.as_ref(), sub_updates)?;
        if repo.find_tree(new_sub_oid)?.is_empty() {
            if builder.get(prefix)?.is_some() {
                builder.remove(prefix)?;
            }
        } else {
            builder.insert(prefix, new_sub_oid, 0o040_000)?;
        }
    }

    Ok(builder.write()?)
}

// ---------------------------------------------------------------------------
// Index helpers
// ---------------------------------------------------------------------------

fn resolve_head_commit_oid(repo: &Repository) -> Result<Option<Oid>> {
    match repo.head().and_then(|head| head.peel_to_commit()) {
        Ok(commit) => Ok(Some(commit.id())),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Refresh an index from `HEAD` so stale index state cannot leak between commits.
fn reset_index_to_head(repo: &Repository, index: &mut git2::Index) -> Result<()> {
    if let Some(commit_oid) = resolve_head_commit_oid(repo)? {
        let tree = repo.find_commit(commit_oid)?.tree()?;
        index.read_tree(&tree)?;
    } else {
        index.clear()?;
    }
    Ok(())
}

/// Best-effort cleanup of staged state after a failed commit attempt.
fn try_restore_index(repo: &Repository) {
    let restored = repo.index().and_then(|mut index| {
        match resolve_head_commit_oid(repo) {
            Ok(Some(oid)) => {
                let tree = repo.find_commit(oid)?.tree()?;
                index.read_tree(&tree)?;
            }
            Ok(None) => index.clear()?,
            Err(_) => return Ok(()),
        }
        index.write()
    });
    if let Err(e) = restored {
        tracing::warn!("[commit] failed to restore index after failed commit: {e}");
    }
}

fn is_git_index_lock_error(err: &git2::Error) -> bool {
    let msg = err.message().to_lowercase();
    err.code() == ErrorCode::Locked
        || msg.contains("index.lock")
        || msg.contains("index is locked")
}

fn is_non_fast_forward(err: &git2::Error) -> bool {
    err.code() == ErrorCode::NotFastForward || is_non_fast_forward_message(err.message())
}

fn is_non_fast_forward_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("non-fast-forward")
        || msg.contains("fastforward")
        || msg.contains("fetch first")
        || msg.contains("not present locally")
        || msg.contains("cannot lock ref")
        || msg.contains("failed to update ref")
        || msg.contains("failed to lock file")
}

/// Remove a `.git/index.lock` older than `max_age` left by a crashed git process.
fn try_clean_stale_git_lock(repo_root: &Path, max_age: Duration) -> bool {
    let lock_path = repo_root.join(".git").join("index.lock");
    let age = fs::metadata(&lock_path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| SystemTime::now().duration_since(t).ok());

    match age {
        Some(age) if age > max_age => {
            tracing::info!(
                "[commit] removing stale index.lock (age={:.1}s)",
                age.as_secs_f64()
            );
            fs::remove_file(&lock_path).is_ok()
        }
        _ => false,
    }
}
