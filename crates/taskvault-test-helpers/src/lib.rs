//! Repository factories shared by the taskvault test suites.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use git2::Repository;
use taskvault_core::Config;
use tempfile::TempDir;

/// A bare repository in a temp dir, standing in for a shared remote.
pub struct TestRemote {
    dir: TempDir,
}

impl TestRemote {
    /// # Panics
    /// When the temp dir or the bare repository cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir for remote");
        let repo = Repository::init_bare(dir.path()).expect("git init --bare");
        repo.set_head("refs/heads/main").expect("point HEAD at main");
        Self { dir }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// URL usable as `TASKS_REPO_REMOTE`.
    #[must_use]
    pub fn url(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    /// Tip of `branch` on the remote, if it exists.
    ///
    /// # Panics
    /// When the bare repository cannot be opened.
    #[must_use]
    pub fn tip(&self, branch: &str) -> Option<git2::Oid> {
        let repo = Repository::open_bare(self.dir.path()).expect("open bare remote");
        repo.refname_to_id(&format!("refs/heads/{branch}")).ok()
    }

    /// Number of commits reachable from the remote `main`.
    ///
    /// # Panics
    /// When the bare repository cannot be walked.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        let Some(tip) = self.tip("main") else {
            return 0;
        };
        let repo = Repository::open_bare(self.dir.path()).expect("open bare remote");
        let mut walk = repo.revwalk().expect("revwalk");
        walk.push(tip).expect("push tip");
        walk.count()
    }
}

impl Default for TestRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// Config for a writer with its own working copy under `dir`, syncing with
/// `remote`. Background sync is off so tests drive `sync_now` themselves.
#[must_use]
pub fn writer_config(remote: &TestRemote, dir: &Path) -> Config {
    Config {
        remote_url: Some(remote.url()),
        ..local_config(dir)
    }
}

/// Config for a repository under `dir` with no remote.
#[must_use]
pub fn local_config(dir: &Path) -> Config {
    Config {
        repo_path: repo_dir(dir),
        auto_sync_enabled: false,
        sync_on_startup: false,
        sync_on_close: false,
        auto_push_on_change: false,
        lock_timeout_seconds: 5,
        network_timeout_seconds: 30,
        ..Config::default()
    }
}

fn repo_dir(dir: &Path) -> PathBuf {
    dir.join("tasks-repo")
}
