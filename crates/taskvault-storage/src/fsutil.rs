//! Filesystem helpers shared by the store and the commit log.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Result, StorageError};

/// Prefix of in-flight temp files; ignored by git and swept on recovery.
pub const TMP_PREFIX: &str = ".tmp-";

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write bytes to a file atomically via a temp file + rename.
///
/// The temp file is created in the same directory as the target so that
/// `fs::rename` is atomic (same filesystem).
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{TMP_PREFIX}{}-{}-{seq}",
        std::process::id(),
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    let tmp_path = parent.join(&tmp_name);
    let mut f = fs::File::create(&tmp_path)?;
    f.write_all(data)?;
    f.sync_data()?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        e.into()
    })
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn validate_repo_relative_path<'a>(kind: &str, raw: &'a str) -> Result<&'a str> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(StorageError::InvalidPath(format!("{kind} is empty")));
    }
    if s.contains('\\') {
        return Err(StorageError::InvalidPath(format!(
            "{kind} must use forward slashes"
        )));
    }
    if s.contains('\0') {
        return Err(StorageError::InvalidPath(format!(
            "{kind} must not contain NUL"
        )));
    }
    if s.starts_with('/') || s.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(StorageError::InvalidPath(format!(
            "{kind} must be a normalized relative path: {s}"
        )));
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks").join("t-1.json");
        ensure_parent_dir(&path).unwrap();
        atomic_write_bytes(&path, b"{\"a\": 1}\n").unwrap();
        atomic_write_bytes(&path, b"{\"a\": 2}\n").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\": 2}\n");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(!remove_file_if_exists(&dir.path().join("nope")).unwrap());
    }

    #[test]
    fn relative_path_validation() {
        assert!(validate_repo_relative_path("p", "tasks/t-1.json").is_ok());
        for bad in ["", "/abs", "tasks/../x", "a//b", "a\\b", "./a"] {
            assert!(validate_repo_relative_path("p", bad).is_err(), "{bad}");
        }
    }
}
