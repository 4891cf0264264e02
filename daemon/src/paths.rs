/// Canonical file layout inside the AutoWake working directory.
///
/// ```text
/// <work_dir>/
///   config.toml          Written by the settings UI, read by every worker.
///   autowake.log         Appended to by every worker.
///   coordination/*.toml  Cross-worker signals, one file per writer.
///   locks/<role>.lock    Owner pid of each running worker role.
///   profiles/<name>/     Browser profile directory per surface.
///   surfaces/*.html      Generated overlay pages.
/// ```
use std::path::{Path, PathBuf};

use crate::config::Role;

pub const WORK_DIR_ENV: &str = "AUTOWAKE_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOG_FILE_NAME: &str = "autowake.log";
pub const BUNDLED_SAVER_IMAGE: &str = "default_saver.png";

#[cfg(windows)]
const DEFAULT_WORK_DIR: &str = r"C:\AutoWake";

/// Returns the default working directory: `%AUTOWAKE_DIR%`, else
/// `C:\AutoWake` on Windows, else `<temp>/autowake`.
pub fn default_work_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(WORK_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        PathBuf::from(DEFAULT_WORK_DIR)
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir().join("autowake")
    }
}

/// Resolved paths rooted at one working directory.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE_NAME)
    }

    pub fn coordination_dir(&self) -> PathBuf {
        self.root.join("coordination")
    }

    pub fn lock_file(&self, role: Role) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", role.as_str()))
    }

    /// Browser profile directory for a named surface (`audio`, `target`,
    /// `saver`, `notice`).
    pub fn profile_dir(&self, surface: &str) -> PathBuf {
        self.root.join("profiles").join(surface)
    }

    pub fn surface_page(&self, surface: &str) -> PathBuf {
        self.root.join("surfaces").join(format!("{surface}.html"))
    }

    pub fn bundled_saver_image(&self) -> PathBuf {
        self.root.join(BUNDLED_SAVER_IMAGE)
    }
}
