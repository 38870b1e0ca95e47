//! Cross-process repository lock.
//!
//! The lock is a single marker file created with `O_EXCL` that records the
//! holder's pid and acquisition time. While held, the holder also keeps an
//! advisory `flock` on the marker. A marker is only ever reclaimed by a prober
//! that holds that flock itself, so two probers can never both remove it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskvault_core::models::now_micros;

use crate::fsutil::{ensure_parent_dir, remove_file_if_exists};
use crate::{Result, StorageError};

/// Marker file name inside the repository's `.git` directory.
pub const LOCK_FILE_NAME: &str = "taskvault.lock";

/// How long an unreadable marker is given to be filled in by its creator.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub holder: String,
}

impl LockMarker {
    fn current(holder: &str) -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: now_micros(),
            holder: holder.to_string(),
        }
    }
}

/// What a stale check found at the marker path.
#[derive(Debug)]
enum Probe {
    Absent,
    Reclaimed,
    Held(Option<LockMarker>),
}

#[derive(Debug, Clone)]
pub struct RepositoryLock {
    path: PathBuf,
    timeout: Duration,
    stale_after: Option<Duration>,
    holder: String,
}

impl RepositoryLock {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            timeout: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(600)),
            holder: "taskvault".to_string(),
        }
    }

    /// Lock scoped to the repository whose git directory is `git_dir`.
    pub fn for_git_dir(git_dir: &Path) -> Self {
        Self::new(git_dir.join(LOCK_FILE_NAME))
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Age after which a marker whose pid is still running, but whose
    /// advisory lock is free, is taken to name a recycled pid (`None` = never).
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<LockGuard> {
        let start = Instant::now();
        ensure_parent_dir(&self.path)?;

        let mut attempt: u32 = 0;
        loop {
            if let Some(guard) = self.try_acquire()? {
                if attempt > 0 {
                    tracing::debug!(
                        attempts = attempt + 1,
                        waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "[lock] acquired {}",
                        self.path.display()
                    );
                }
                return Ok(guard);
            }

            let holder = match self.probe()? {
                Probe::Absent | Probe::Reclaimed => continue,
                Probe::Held(marker) => marker,
            };

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                let who = holder.map_or_else(
                    || "unknown holder".to_string(),
                    |m| format!("pid {} ({}) since {}", m.pid, m.holder, m.acquired_at),
                );
                return Err(StorageError::LockBusy(format!(
                    "{} held by {who}; gave up after {:.2}s",
                    self.path.display(),
                    elapsed.as_secs_f64()
                )));
            }

            // Exponential backoff with per-thread jitter.
            let base_ms = 25 * (1u64 << attempt.min(4));
            let jitter = thread_jitter_ms(base_ms / 2 + 1);
            let sleep = Duration::from_millis(base_ms + jitter).min(self.timeout - elapsed);
            std::thread::sleep(sleep.max(Duration::from_millis(1)));
            attempt = attempt.saturating_add(1);
        }
    }

    /// Single attempt; `Ok(None)` when a marker already exists.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A prober may hold the flock for an instant while it reads the empty marker.
        let locked = fs2::FileExt::lock_exclusive(&file);
        let marker = LockMarker::current(&self.holder);
        let written = locked.and_then(|()| {
            let json = serde_json::to_vec(&marker).map_err(io::Error::other)?;
            file.write_all(&json)?;
            file.sync_data()
        });
        if let Err(e) = written {
            drop(file);
            let _ = remove_file_if_exists(&self.path);
            return Err(e.into());
        }

        Ok(Some(LockGuard {
            path: self.path.clone(),
            file: Some(file),
            marker,
        }))
    }

    /// Current marker, if any and readable.
    pub fn inspect(&self) -> Option<LockMarker> {
        let contents = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Remove a stale marker left by a crashed holder. Returns whether one was removed.
    pub fn heal(&self) -> Result<bool> {
        Ok(matches!(self.probe()?, Probe::Reclaimed))
    }

    fn probe(&self) -> Result<Probe> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Absent),
            Err(e) => return Err(e.into()),
        };
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let marker = serde_json::from_slice::<LockMarker>(&contents).ok();
        // Holding this flock (until `file` drops) also keeps other probers out.
        let flock_free = fs2::FileExt::try_lock_exclusive(&file).is_ok();

        // Only the prober holding the flock may judge; a held flock means a
        // live holder or another prober mid-reclaim.
        let reason = if flock_free {
            let age = file_age(&file).unwrap_or_default();
            match &marker {
                Some(m) if !pid_alive(m.pid) => {
                    Some(format!("holder pid {} is not running", m.pid))
                }
                Some(m) if self.stale_after.is_some_and(|limit| age >= limit) => Some(format!(
                    "pid {} has not held the advisory lock for {:.0}s",
                    m.pid,
                    age.as_secs_f64()
                )),
                Some(_) => None,
                None if age >= UNREADABLE_GRACE => Some(format!(
                    "unreadable marker abandoned for {:.1}s",
                    age.as_secs_f64()
                )),
                None => None,
            }
        } else {
            None
        };

        let Some(reason) = reason else {
            return Ok(Probe::Held(marker));
        };

        // Only remove the marker we judged; a fresh one may have replaced it.
        match fs::read(&self.path) {
            Ok(current) if current == contents => {
                remove_file_if_exists(&self.path)?;
                tracing::warn!(
                    path = %self.path.display(),
                    "[lock] reclaimed stale lock marker: {reason}"
                );
                Ok(Probe::Reclaimed)
            }
            Ok(_) => Ok(Probe::Held(None)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Probe::Absent),
            Err(e) => Err(e.into()),
        }
    }
}

/// Scoped lock ownership; the marker is removed when the guard drops.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
    marker: LockMarker,
}

impl LockGuard {
    pub const fn marker(&self) -> &LockMarker {
        &self.marker
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner().map_err(Into::into)
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while still holding the flock so nobody can judge it stale in between.
        let removed = remove_file_if_exists(&self.path);
        drop(file);
        removed.map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(
                path = %self.path.display(),
                "[lock] failed to remove lock marker: {e}"
            );
        }
    }
}

fn file_age(file: &File) -> Option<Duration> {
    let modified = file.metadata().ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 checks existence; EPERM means it exists under another user.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Without a liveness probe, rely on the advisory lock alone.
#[cfg(not(unix))]
pub(crate) fn pid_alive(pid: u32) -> bool {
    pid != 0
}

/// xorshift64 jitter, seeded per thread so contenders don't retry in lockstep.
fn thread_jitter_ms(range: u64) -> u64 {
    use std::cell::Cell;

    thread_local! {
        static STATE: Cell<u64> = Cell::new({
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            let tid = format!("{:?}", std::thread::current().id());
            let seed = u64::from(nanos)
                ^ (tid.len() as u64).wrapping_mul(0x517c_c1b7_2722_0a95)
                ^ u64::from(std::process::id()).rotate_left(32);
            if seed == 0 { 1 } else { seed }
        });
    }

    if range == 0 {
        return 0;
    }

    STATE.with(|cell| {
        let mut s = cell.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        cell.set(s);
        s % range
    })
}
