/// Browser process launching.
///
/// A [`ProcessLauncher`] turns a [`LaunchRequest`] (URLs, profile directory,
/// window mode, flags) into a running process. The production implementation
/// starts Chrome; tests substitute an in-memory fake.
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;
use tracing::info;

use crate::config::WindowMode;
use crate::inspector::WindowInspector;

const CHROME_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
];
const CHROME_ON_PATH: &str = "chrome";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no URL to open")]
    NoUrls,
    #[error("failed to create profile directory {path}: {source}")]
    Profile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything needed to start one browser surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub urls: Vec<String>,
    pub profile_dir: PathBuf,
    pub mode: WindowMode,
    /// Allow media to start without a user gesture.
    pub autoplay: bool,
    /// Keep timers and renderers running while the window is hidden.
    pub isolate_background: bool,
    pub app_id: Option<String>,
}

pub trait ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError>;
}

/// How a worker came to know about a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Started by this worker.
    Spawned,
    /// Found already running by an OS scan.
    Adopted,
}

/// The canonical process of a role.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    origin: Origin,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn spawned(child: Child) -> Self {
        Self {
            pid: child.id(),
            origin: Origin::Spawned,
            child: Some(child),
        }
    }

    pub fn adopted(pid: u32) -> Self {
        Self {
            pid,
            origin: Origin::Adopted,
            child: None,
        }
    }

    /// A spawned handle without an owned `Child`, for launchers that do not
    /// create real processes.
    #[cfg(test)]
    pub fn spawned_pid(pid: u32) -> Self {
        Self {
            pid,
            origin: Origin::Spawned,
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_alive(&mut self, inspector: &dyn WindowInspector) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) => false,
                Err(_) => inspector.is_alive(self.pid),
            },
            None => inspector.is_alive(self.pid),
        }
    }

    /// Kills the process (reaping it when owned).
    pub fn terminate(mut self, inspector: &dyn WindowInspector) {
        match self.child.take() {
            Some(mut child) => {
                if child.kill().is_ok() {
                    let _ = child.wait();
                }
            }
            None => {
                inspector.terminate(self.pid);
            }
        }
    }
}

/// Launches Chrome with a dedicated profile directory per surface.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    exe: PathBuf,
}

impl ChromeLauncher {
    /// Uses `explicit` when given, else the first installed Chrome, else
    /// `chrome` from `PATH`.
    pub fn discover(explicit: Option<&Path>) -> Self {
        let exe = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                CHROME_CANDIDATES
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.exists())
            })
            .unwrap_or_else(|| PathBuf::from(CHROME_ON_PATH));
        Self { exe }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }
}

impl ProcessLauncher for ChromeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError> {
        if request.urls.is_empty() {
            return Err(LaunchError::NoUrls);
        }
        std::fs::create_dir_all(&request.profile_dir).map_err(|source| LaunchError::Profile {
            path: request.profile_dir.clone(),
            source,
        })?;

        let args = build_args(request);
        info!(exe = %self.exe.display(), ?args, "Launching browser");
        let child = Command::new(&self.exe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                exe: self.exe.clone(),
                source,
            })?;
        Ok(ProcessHandle::spawned(child))
    }
}

/// Chrome command line for `request`, without the executable.
pub fn build_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = vec![
        format!("--user-data-dir={}", request.profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--new-window".to_string(),
    ];
    if request.autoplay {
        args.push("--autoplay-policy=no-user-gesture-required".to_string());
    }
    if request.isolate_background {
        args.extend(
            [
                "--disable-background-timer-throttling",
                "--disable-backgrounding-occluded-windows",
                "--disable-renderer-backgrounding",
            ]
            .map(String::from),
        );
    }
    match request.mode {
        WindowMode::Minimized => args.push("--start-minimized".to_string()),
        WindowMode::Normal => {}
        WindowMode::Fullscreen => args.push("--start-fullscreen".to_string()),
        WindowMode::Kiosk => args.push("--kiosk".to_string()),
    }
    if let Some(id) = &request.app_id {
        args.push(format!("--app-id={id}"));
    }
    args.extend(request.urls.iter().map(|url| {
        if request.autoplay {
            ensure_youtube_autoplay(url)
        } else {
            url.clone()
        }
    }));
    args
}

/// Appends autoplay parameters to YouTube URLs that do not set them.
pub fn ensure_youtube_autoplay(url: &str) -> String {
    let is_youtube = url.contains("youtube.com") || url.contains("youtu.be");
    if !is_youtube || url.contains("autoplay=") {
        return url.to_string();
    }
    let connector = if url.contains('?') { '&' } else { '?' };
    format!("{url}{connector}autoplay=1&mute=0&playsinline=1")
}
