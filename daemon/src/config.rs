use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::coordination::write_atomic;
use crate::event::WorkerEvent;

/// Lower bound on the worker tick interval.
pub const MIN_POLL_SECS: f64 = 0.2;
pub const DEFAULT_POLL_SECS: f64 = 0.5;
pub const DEFAULT_TARGET_URL: &str = "https://lib.koreatech.ac.kr/search/i-discovery";
pub const DEFAULT_IDLE_TO_SHOW_SECS: f64 = 10.0;
pub const DEFAULT_ACTIVE_THRESHOLD_SECS: f64 = 1.0;
pub const DEFAULT_WATCHDOG_GRACE_MS: u64 = 2_000;
pub const DEFAULT_TRANSITION_HOLD_MS: u64 = 800;
pub const DEFAULT_LOCK_DELAY_MS: u64 = 500;

const DEFAULT_NOTICE_TITLE: &str = "Notice";
const DEFAULT_NOTICE_MESSAGE: &str = "This PC is reserved for library catalogue search.\n\n\
The library search page is shown as the default window. Please use this PC for study \
and research only.\n\n\
Press F11 to leave full screen, or Alt+F4 to close the browser. \
The browser restarts automatically a few seconds after it is closed.";
const DEFAULT_NOTICE_FOOTER: &str = "Close this window (Alt+F4) to continue.";

/// An independently supervised kiosk surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Audio,
    Target,
    Saver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Audio => "audio",
            Role::Target => "target",
            Role::Saver => "saver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the browser window of a surface is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    Minimized,
    Normal,
    Fullscreen,
    Kiosk,
}

/// Whether a role relaunches perpetually or once per configuration epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    Repeat,
    Once,
}

/// Source of the screensaver picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaverImageMode {
    /// `<work_dir>/default_saver.png`.
    Bundled,
    /// `saver.image_path`.
    Path,
    /// A placeholder page, no image.
    Generated,
}

/// Root configuration. Deserialized from `<work_dir>/config.toml`.
///
/// Workers treat a snapshot as immutable; a reload replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub general: GeneralConfig,
    pub audio: AudioConfig,
    pub target: TargetConfig,
    pub saver: SaverConfig,
    pub notice: NoticeConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Redirects to another working directory holding the authoritative
    /// `config.toml`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Worker tick interval in seconds. Clamped to at least [`MIN_POLL_SECS`].
    pub poll_sec: f64,
    /// Explicit browser executable; discovered when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_path: Option<PathBuf>,
    /// How long a launched window may be missing before its process is
    /// recycled.
    pub watchdog_grace_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            poll_sec: DEFAULT_POLL_SECS,
            browser_path: None,
            watchdog_grace_ms: DEFAULT_WATCHDOG_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub window_mode: WindowMode,
    pub start_delay_sec: f64,
    pub relaunch_cooldown_sec: f64,
    pub repeat: RepeatPolicy,
    pub autoplay: bool,
    pub isolate_background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: Vec::new(),
            window_mode: WindowMode::Minimized,
            start_delay_sec: 2.0,
            relaunch_cooldown_sec: 10.0,
            repeat: RepeatPolicy::Repeat,
            autoplay: true,
            isolate_background: true,
            app_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub window_mode: WindowMode,
    pub start_delay_sec: f64,
    pub relaunch_cooldown_sec: f64,
    pub repeat: RepeatPolicy,
    pub autoplay: bool,
    pub isolate_background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Interval between re-raising the target window. `0` disables refocus.
    pub refocus_interval_sec: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            urls: vec![DEFAULT_TARGET_URL.to_string()],
            window_mode: WindowMode::Fullscreen,
            start_delay_sec: 1.0,
            relaunch_cooldown_sec: 10.0,
            repeat: RepeatPolicy::Repeat,
            autoplay: false,
            isolate_background: false,
            app_id: None,
            refocus_interval_sec: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    pub enabled: bool,
    /// Idle time at or above which the screensaver is shown.
    pub idle_to_show_sec: f64,
    /// Idle time at or below which the screensaver is hidden again.
    /// Must be strictly less than `idle_to_show_sec`.
    pub active_threshold_sec: f64,
    pub start_delay_sec: f64,
    pub image_mode: SaverImageMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_to_show_sec: DEFAULT_IDLE_TO_SHOW_SECS,
            active_threshold_sec: DEFAULT_ACTIVE_THRESHOLD_SECS,
            start_delay_sec: 1.0,
            image_mode: SaverImageMode::Bundled,
            image_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeConfig {
    pub enabled: bool,
    pub title: String,
    pub message: String,
    /// Small print under the message. Empty hides it.
    pub footer: String,
    /// Re-show a dismissed notice after `repeat_interval_sec` when the
    /// screensaver is disabled.
    pub repeat_enabled: bool,
    pub repeat_interval_sec: f64,
    /// Quiet period after the UI or screensaver flips before the notice may
    /// show again.
    pub transition_hold_ms: u64,
    /// Time the notice must be visible before it takes the interaction lock.
    pub lock_delay_ms: u64,
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: DEFAULT_NOTICE_TITLE.to_string(),
            message: DEFAULT_NOTICE_MESSAGE.to_string(),
            footer: DEFAULT_NOTICE_FOOTER.to_string(),
            repeat_enabled: false,
            repeat_interval_sec: 300.0,
            transition_hold_ms: DEFAULT_TRANSITION_HOLD_MS,
            lock_delay_ms: DEFAULT_LOCK_DELAY_MS,
        }
    }
}

/// Settings-UI password material. Opaque to the workers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub password_hash: String,
    pub password_salt: String,
}

/// Converts a seconds value from the config into a `Duration`, treating
/// negative and NaN values as zero.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl ConfigSnapshot {
    /// Effective tick interval.
    pub fn poll_interval(&self) -> Duration {
        secs(self.general.poll_sec.max(MIN_POLL_SECS))
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.general.watchdog_grace_ms)
    }

    /// The notice is hosted by the target worker and only runs alongside it.
    pub fn notice_active(&self) -> bool {
        self.notice.enabled && self.target.enabled
    }

    /// Repairs values that would break worker invariants, logging each fix.
    pub fn normalized(mut self) -> Self {
        if !(self.general.poll_sec >= MIN_POLL_SECS) {
            warn!(poll_sec = self.general.poll_sec, "poll interval too small, clamping");
            self.general.poll_sec = MIN_POLL_SECS;
        }

        let saver = &mut self.saver;
        if !(saver.active_threshold_sec < saver.idle_to_show_sec) || saver.active_threshold_sec < 0.0 {
            warn!(
                active = saver.active_threshold_sec,
                idle = saver.idle_to_show_sec,
                "screensaver thresholds overlap, using defaults"
            );
            saver.idle_to_show_sec = DEFAULT_IDLE_TO_SHOW_SECS;
            saver.active_threshold_sec = DEFAULT_ACTIVE_THRESHOLD_SECS;
        }

        self.audio.urls = clean_urls(std::mem::take(&mut self.audio.urls));
        if self.audio.enabled && self.audio.urls.is_empty() {
            warn!("audio is enabled without any URL, disabling");
            self.audio.enabled = false;
        }
        self.target.urls = clean_urls(std::mem::take(&mut self.target.urls));
        if self.target.enabled && self.target.urls.is_empty() {
            warn!("target is enabled without any URL, disabling");
            self.target.enabled = false;
        }
        self
    }
}

fn clean_urls(urls: Vec<String>) -> Vec<String> {
    urls.into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

fn parse_file(path: &Path) -> Result<ConfigSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads the config file at `path`, returning the defaults if it does not exist.
/// Follows a `general.work_dir` redirect once when the target directory holds
/// its own `config.toml`.
/// Returns an error if a file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<ConfigSnapshot> {
    load_resolved(path).map(|(config, _)| config)
}

/// Like [`load_or_default`], also returning the file the snapshot came from.
fn load_resolved(path: &Path) -> Result<(ConfigSnapshot, PathBuf)> {
    if !path.exists() {
        return Ok((ConfigSnapshot::default().normalized(), path.to_path_buf()));
    }
    let config = parse_file(path)?;
    match redirect_target(&config, path) {
        Some(redirected) => {
            let config = parse_file(&redirected)?;
            Ok((config.normalized(), redirected))
        }
        None => Ok((config.normalized(), path.to_path_buf())),
    }
}

/// The config file `general.work_dir` points at, when it names another
/// directory that holds one.
fn redirect_target(config: &ConfigSnapshot, path: &Path) -> Option<PathBuf> {
    let redirected = config
        .general
        .work_dir
        .as_ref()?
        .join(crate::paths::CONFIG_FILE_NAME);
    (redirected != path && redirected.exists()).then_some(redirected)
}

/// Serializes `config` to TOML and atomically replaces the file at `path`.
pub fn save(path: &Path, config: &ConfigSnapshot) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Writes the default configuration when no file exists yet.
/// Returns `true` when a file was created.
pub fn ensure_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    save(path, &ConfigSnapshot::default())?;
    Ok(true)
}

/// Loads snapshots while remembering the last one that parsed, so a corrupt
/// file never replaces a good snapshot.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    /// The file the last good snapshot was read from, after redirects.
    resolved: PathBuf,
    last_good: Option<ConfigSnapshot>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            resolved: path.clone(),
            path,
            last_good: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolved_path(&self) -> &Path {
        &self.resolved
    }

    /// Whether a change to `file` can change the snapshot.
    pub fn tracks(&self, file: &Path) -> bool {
        file == self.path || file == self.resolved
    }

    /// Returns the current snapshot, or the last-known-good one (defaults if
    /// none) when the file is unreadable.
    pub fn load(&mut self) -> ConfigSnapshot {
        match self.try_reload() {
            Some(config) => config,
            None => self.last_good.clone().unwrap_or_default(),
        }
    }

    /// Re-reads the file. Returns `None` (after logging) when it is corrupt.
    pub fn try_reload(&mut self) -> Option<ConfigSnapshot> {
        match load_resolved(&self.path) {
            Ok((config, resolved)) => {
                if resolved != self.resolved {
                    info!(file = %resolved.display(), "Config redirected");
                    self.resolved = resolved;
                }
                self.last_good = Some(config.clone());
                Some(config)
            }
            Err(e) => {
                warn!("Config error (keeping last good snapshot): {e:#}");
                None
            }
        }
    }
}

/// Spawns a file watcher on the directories of the store's base file and of
/// the file it redirects to. Whenever either file is created or modified,
/// reloads and sends a `ConfigReloaded` event. Corrupt writes are logged and
/// skipped.
pub async fn watch_config(mut store: ConfigStore, tx: mpsc::Sender<WorkerEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Directories, not files, so editor-style atomic saves (write + rename)
    // are seen.
    let mut watched: Vec<PathBuf> = Vec::new();
    if !watch_parent(&mut watcher, &mut watched, store.path()) {
        return;
    }
    watch_parent(&mut watcher, &mut watched, store.resolved_path());

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| store.tracks(p));
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            if let Some(config) = store.try_reload() {
                info!("Config reloaded");
                let resolved = store.resolved_path().to_path_buf();
                watch_parent(&mut watcher, &mut watched, &resolved);
                if tx.send(WorkerEvent::ConfigReloaded(config)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Adds the directory of `file` to the watch set unless already present.
fn watch_parent(watcher: &mut RecommendedWatcher, watched: &mut Vec<PathBuf>, file: &Path) -> bool {
    let Some(dir) = file.parent() else {
        warn!("Config path has no parent directory: {}", file.display());
        return false;
    };
    if watched.iter().any(|d| d == dir) {
        return true;
    }
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch config directory {}: {e}", dir.display());
        return false;
    }
    watched.push(dir.to_path_buf());
    true
}
