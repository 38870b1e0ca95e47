//! XDG Base Directory path resolution.
//!
//! - Config: `~/.config/taskvault/env` (or `$XDG_CONFIG_HOME/taskvault/env`)
//! - Default repository: `~/taskvault-tasks`

use std::path::PathBuf;

const APP_DIR: &str = "taskvault";

/// Returns the configuration directory for taskvault.
///
/// Priority order:
/// 1. `$XDG_CONFIG_HOME/taskvault/` (if `XDG_CONFIG_HOME` is set)
/// 2. `~/.config/taskvault/` (default)
/// 3. `%APPDATA%/taskvault/` (Windows)
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME")
        && !xdg_config.is_empty()
    {
        return PathBuf::from(xdg_config).join(APP_DIR);
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(app_data) = dirs::config_dir() {
            return app_data.join(APP_DIR);
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(".config").join(APP_DIR);
        }
    }

    PathBuf::from(".config").join(APP_DIR)
}

/// Path of the user-global env file.
#[must_use]
pub fn env_file_path() -> PathBuf {
    config_dir().join("env")
}

/// Default location of the task repository when `TASKS_REPO_PATH` is unset.
#[must_use]
pub fn default_repo_path() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from("taskvault-tasks"),
        |home| home.join("taskvault-tasks"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_lives_in_config_dir() {
        let path = env_file_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("env"));
        assert_eq!(path.parent(), Some(config_dir().as_path()));
    }

    #[test]
    fn default_repo_path_is_named() {
        assert!(default_repo_path().ends_with("taskvault-tasks"));
    }
}
