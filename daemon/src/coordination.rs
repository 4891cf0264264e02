/// File-backed signals shared between worker processes.
///
/// The record is split into partitions, each with exactly one writer role, so
/// concurrent workers never overwrite each other's fields:
///
/// | file          | fields                                | writer              |
/// |---------------|---------------------------------------|---------------------|
/// | `ui.toml`     | `ui_active_ref_count`                 | settings UI (`ui`)  |
/// | `saver.toml`  | `saver_active`, `saver_trigger_at`    | saver worker        |
/// | `notice.toml` | `notice_dismissed_at`                 | target worker, CLI  |
///
/// Every write replaces the file atomically. Readers merge the partitions and
/// treat a missing or malformed partition as all zero/false.
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const STATE_VERSION: u32 = 1;

/// Merged view of all partitions. Timestamps are unix milliseconds, `0` = never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CoordinationState {
    /// Number of interactive UI windows currently frontmost.
    pub ui_active_ref_count: u32,
    pub saver_active: bool,
    pub saver_trigger_at: i64,
    pub notice_dismissed_at: i64,
}

impl CoordinationState {
    pub fn ui_active(&self) -> bool {
        self.ui_active_ref_count > 0
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

trait Partition: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn version(&self) -> u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct UiPartition {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    ui_active_ref_count: u32,
}

impl Default for UiPartition {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            ui_active_ref_count: 0,
        }
    }
}

impl Partition for UiPartition {
    const FILE_NAME: &'static str = "ui.toml";
    fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SaverPartition {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    saver_active: bool,
    #[serde(default)]
    saver_trigger_at: i64,
}

impl Default for SaverPartition {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saver_active: false,
            saver_trigger_at: 0,
        }
    }
}

impl Partition for SaverPartition {
    const FILE_NAME: &'static str = "saver.toml";
    fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NoticePartition {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    notice_dismissed_at: i64,
}

impl Default for NoticePartition {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            notice_dismissed_at: 0,
        }
    }
}

impl Partition for NoticePartition {
    const FILE_NAME: &'static str = "notice.toml";
    fn version(&self) -> u32 {
        self.version
    }
}

/// Reads and writes the coordination partitions under one directory.
#[derive(Debug, Clone)]
pub struct CoordinationStore {
    dir: PathBuf,
}

impl CoordinationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the merged state. Never fails.
    pub fn load(&self) -> CoordinationState {
        let ui: UiPartition = self.read();
        let saver: SaverPartition = self.read();
        let notice: NoticePartition = self.read();
        CoordinationState {
            ui_active_ref_count: ui.ui_active_ref_count,
            saver_active: saver.saver_active,
            saver_trigger_at: saver.saver_trigger_at,
            notice_dismissed_at: notice.notice_dismissed_at,
        }
    }

    /// Increments the interactive-UI ref count. Returns the new value.
    pub fn ui_enter(&self) -> Result<u32> {
        let mut ui: UiPartition = self.read();
        ui.ui_active_ref_count = ui.ui_active_ref_count.saturating_add(1);
        self.write(&ui)?;
        Ok(ui.ui_active_ref_count)
    }

    /// Decrements the interactive-UI ref count, clamping at zero so duplicate
    /// leave signals from restarted processes are harmless.
    pub fn ui_leave(&self) -> Result<u32> {
        let mut ui: UiPartition = self.read();
        ui.ui_active_ref_count = ui.ui_active_ref_count.saturating_sub(1);
        self.write(&ui)?;
        Ok(ui.ui_active_ref_count)
    }

    /// Records a screensaver transition. Entering stamps a fresh trigger time;
    /// leaving keeps the last one.
    pub fn set_saver_active(&self, active: bool, now_ms: i64) -> Result<()> {
        let mut saver: SaverPartition = self.read();
        saver.saver_active = active;
        if active {
            saver.saver_trigger_at = now_ms;
        }
        self.write(&saver)
    }

    pub fn record_notice_dismissed(&self, now_ms: i64) -> Result<()> {
        self.write(&NoticePartition {
            version: STATE_VERSION,
            notice_dismissed_at: now_ms,
        })
    }

    fn partition_path<P: Partition>(&self) -> PathBuf {
        self.dir.join(P::FILE_NAME)
    }

    fn read<P: Partition>(&self) -> P {
        let path = self.partition_path::<P>();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return P::default(),
            Err(e) => {
                warn!("Failed to read {}: {e}", path.display());
                return P::default();
            }
        };
        match toml::from_str::<P>(&content) {
            Ok(p) if p.version() == STATE_VERSION => p,
            Ok(p) => {
                warn!(
                    version = p.version(),
                    "Ignoring {} with unknown version",
                    path.display()
                );
                P::default()
            }
            Err(e) => {
                warn!("Treating malformed {} as empty: {e}", path.display());
                P::default()
            }
        }
    }

    fn write<P: Partition>(&self, partition: &P) -> Result<()> {
        let path = self.partition_path::<P>();
        let content = toml::to_string_pretty(partition)
            .with_context(|| format!("Failed to serialize {}", P::FILE_NAME))?;
        write_atomic(&path, content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so
/// readers observe either the old or the new content, never a partial write.
/// Creates the parent directory if it does not exist.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CoordinationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CoordinationStore::new(dir.path().join("coordination"));
        (dir, store)
    }

    // ── load ──────────────────────────────────────────────────────────────────

    #[test]
    fn missing_directory_reads_as_empty() {
        let (_dir, store) = store();
        assert_eq!(store.load(), CoordinationState::default());
    }

    #[test]
    fn malformed_partition_reads_as_empty() {
        let (_dir, store) = store();
        store.set_saver_active(true, 42).unwrap();
        std::fs::write(store.dir.join("ui.toml"), "ui_active_ref_count = [[[").unwrap();

        let state = store.load();
        assert_eq!(state.ui_active_ref_count, 0);
        // Other partitions are unaffected.
        assert!(state.saver_active);
        assert_eq!(state.saver_trigger_at, 42);
    }

    #[test]
    fn negative_ref_count_on_disk_reads_as_zero() {
        let (_dir, store) = store();
        std::fs::create_dir_all(&store.dir).unwrap();
        std::fs::write(
            store.dir.join("ui.toml"),
            "version = 1\nui_active_ref_count = -3\n",
        )
        .unwrap();
        assert_eq!(store.load().ui_active_ref_count, 0);
    }

    #[test]
    fn unknown_version_reads_as_empty() {
        let (_dir, store) = store();
        std::fs::create_dir_all(&store.dir).unwrap();
        std::fs::write(
            store.dir.join("notice.toml"),
            "version = 99\nnotice_dismissed_at = 5\n",
        )
        .unwrap();
        assert_eq!(store.load().notice_dismissed_at, 0);
    }

    // ── ui ref count ──────────────────────────────────────────────────────────

    #[test]
    fn ref_count_never_goes_negative() {
        let (_dir, store) = store();
        assert_eq!(store.ui_leave().unwrap(), 0);
        assert_eq!(store.ui_enter().unwrap(), 1);
        assert_eq!(store.ui_enter().unwrap(), 2);
        assert_eq!(store.ui_leave().unwrap(), 1);
        assert_eq!(store.ui_leave().unwrap(), 0);
        // Duplicate decrements from a restarted worker.
        assert_eq!(store.ui_leave().unwrap(), 0);
        assert_eq!(store.ui_leave().unwrap(), 0);
        assert!(!store.load().ui_active());
    }

    // ── saver / notice ────────────────────────────────────────────────────────

    #[test]
    fn saver_activation_stamps_trigger_and_deactivation_keeps_it() {
        let (_dir, store) = store();
        store.set_saver_active(true, 1_000).unwrap();
        let state = store.load();
        assert!(state.saver_active);
        assert_eq!(state.saver_trigger_at, 1_000);

        store.set_saver_active(false, 2_000).unwrap();
        let state = store.load();
        assert!(!state.saver_active);
        assert_eq!(state.saver_trigger_at, 1_000);
    }

    #[test]
    fn notice_dismissal_persists() {
        let (_dir, store) = store();
        store.record_notice_dismissed(7_777).unwrap();
        let reopened = CoordinationStore::new(store.dir.clone());
        assert_eq!(reopened.load().notice_dismissed_at, 7_777);
    }

    // ── write_atomic ──────────────────────────────────────────────────────────

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.toml");
        write_atomic(&path, b"a = 1\n").unwrap();
        write_atomic(&path, b"a = 2\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 2\n");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn partition_files_carry_version() {
        let (_dir, store) = store();
        store.ui_enter().unwrap();
        let content = std::fs::read_to_string(store.dir.join("ui.toml")).unwrap();
        assert!(content.contains("version = 1"));
        assert!(content.contains("ui_active_ref_count = 1"));
    }
}
