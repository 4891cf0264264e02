/// Full-screen browser overlays (the notice and the screensaver).
///
/// An overlay is a browser window on a dedicated profile showing a local HTML
/// page. The worker tells it each tick what it should look like; the overlay
/// only touches the OS when that differs from what it last applied, so it
/// never steals focus on a steady tick.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::WindowMode;
use crate::coordination::write_atomic;
use crate::inspector::{InspectError, WindowInspector};
use crate::launcher::{LaunchRequest, ProcessHandle, ProcessLauncher};
use crate::notice::NoticeContent;
use crate::schedule::dedup;

/// Minimum gap between launch attempts of one overlay.
pub const RELAUNCH_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayState {
    pub visible: bool,
    /// Topmost and focused.
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    None,
    /// The user closed the overlay while it was shown.
    ClosedByUser,
}

pub struct BrowserOverlay {
    name: &'static str,
    request: LaunchRequest,
    handle: Option<ProcessHandle>,
    /// Last state pushed to the window; `None` for a process we have not
    /// styled yet.
    applied: Option<OverlayState>,
    window_seen: bool,
    last_attempt: Option<Instant>,
}

impl BrowserOverlay {
    pub fn new(name: &'static str, page: &Path, profile_dir: PathBuf) -> Self {
        Self {
            name,
            request: overlay_request(page, profile_dir),
            handle: None,
            applied: None,
            window_seen: false,
            last_attempt: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    #[cfg(test)]
    pub fn applied(&self) -> Option<OverlayState> {
        self.applied
    }

    /// Drives the overlay towards `desired`.
    pub fn reconcile(
        &mut self,
        now: Instant,
        desired: OverlayState,
        launcher: &dyn ProcessLauncher,
        inspector: &dyn WindowInspector,
    ) -> OverlayEvent {
        if self.detect_close(inspector) {
            info!(overlay = self.name, "Overlay closed by user");
            return OverlayEvent::ClosedByUser;
        }
        if desired.visible {
            if !self.ensure_running(now, launcher, inspector) {
                return OverlayEvent::None;
            }
        } else if self.handle.is_none() {
            return OverlayEvent::None;
        }
        let Some(pid) = self.pid() else {
            return OverlayEvent::None;
        };

        // Styling a window that does not exist yet would be lost; wait for it.
        match inspector.find_visible_windows(pid) {
            Ok(windows) if windows.is_empty() => return OverlayEvent::None,
            Ok(_) => self.window_seen = true,
            Err(e) => debug!(overlay = self.name, "Window state unavailable: {e}"),
        }
        self.apply(pid, desired, inspector);
        OverlayEvent::None
    }

    /// Kills the overlay process and any other process on its profile, so the
    /// next show loads the page afresh.
    pub fn reload(&mut self, inspector: &dyn WindowInspector) {
        self.stop(inspector);
        for pid in inspector.find_processes_by_profile(&self.request.profile_dir) {
            inspector.terminate(pid);
        }
    }

    pub fn stop(&mut self, inspector: &dyn WindowInspector) {
        if let Some(handle) = self.handle.take() {
            info!(overlay = self.name, pid = handle.pid(), "Stopping overlay");
            handle.terminate(inspector);
        }
        self.applied = None;
        self.window_seen = false;
    }

    /// Returns true when a shown overlay went away: its process exited or its
    /// last window closed.
    fn detect_close(&mut self, inspector: &dyn WindowInspector) -> bool {
        let shown = self.applied.is_some_and(|s| s.visible);
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if !handle.is_alive(inspector) {
            self.handle = None;
            self.applied = None;
            self.window_seen = false;
            return shown;
        }
        let pid = handle.pid();
        if shown
            && self.window_seen
            && inspector
                .find_visible_windows(pid)
                .is_ok_and(|windows| windows.is_empty())
        {
            self.stop(inspector);
            return true;
        }
        false
    }

    fn ensure_running(
        &mut self,
        now: Instant,
        launcher: &dyn ProcessLauncher,
        inspector: &dyn WindowInspector,
    ) -> bool {
        if self.handle.is_some() {
            return true;
        }
        let found = inspector.find_processes_by_profile(&self.request.profile_dir);
        if let Some(pid) = dedup(&found, inspector) {
            info!(overlay = self.name, pid, "Adopting overlay");
            self.handle = Some(ProcessHandle::adopted(pid));
            return true;
        }
        if self
            .last_attempt
            .is_some_and(|at| now.saturating_duration_since(at) < RELAUNCH_COOLDOWN)
        {
            return false;
        }
        self.last_attempt = Some(now);
        match launcher.launch(&self.request) {
            Ok(handle) => {
                info!(overlay = self.name, pid = handle.pid(), "Overlay launched");
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                warn!(overlay = self.name, "Overlay launch failed: {e}");
                false
            }
        }
    }

    fn apply(&mut self, pid: u32, desired: OverlayState, inspector: &dyn WindowInspector) {
        let current = self.applied;
        if desired.visible {
            if current.map_or(true, |c| !c.visible) {
                self.report("restore", inspector.restore(pid));
                self.report("raise", inspector.raise_and_focus(pid));
                if !desired.locked {
                    self.report("unpin", inspector.set_topmost(pid, false));
                }
            } else if current.is_some_and(|c| c.locked != desired.locked) {
                if desired.locked {
                    self.report("lock", inspector.raise_and_focus(pid));
                } else {
                    self.report("unlock", inspector.set_topmost(pid, false));
                }
            }
        } else if current.map_or(true, |c| c.visible) {
            self.report("unpin", inspector.set_topmost(pid, false));
            self.report("minimize", inspector.minimize(pid));
        }
        if current != Some(desired) {
            debug!(overlay = self.name, ?desired, "Overlay state applied");
        }
        self.applied = Some(desired);
    }

    fn report(&self, op: &str, result: Result<(), InspectError>) {
        if let Err(e) = result {
            debug!(overlay = self.name, op, "Overlay window op failed: {e}");
        }
    }
}

fn overlay_request(page: &Path, profile_dir: PathBuf) -> LaunchRequest {
    LaunchRequest {
        urls: vec![file_url(page)],
        profile_dir,
        mode: WindowMode::Kiosk,
        autoplay: false,
        isolate_background: false,
        app_id: None,
    }
}

/// `file://` URL for a local path, with the characters that would end the path
/// percent-encoded.
pub fn file_url(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    let mut url = String::from("file://");
    if !text.starts_with('/') {
        url.push('/');
    }
    for c in text.chars() {
        match c {
            ' ' => url.push_str("%20"),
            '#' => url.push_str("%23"),
            '%' => url.push_str("%25"),
            '?' => url.push_str("%3F"),
            c => url.push(c),
        }
    }
    url
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_notice_page(content: &NoticeContent) -> String {
    let title = escape_html(&content.title);
    let paragraphs: String = content
        .message
        .split("\n\n")
        .map(|p| format!("<p>{}</p>\n", escape_html(p).replace('\n', "<br>")))
        .collect();
    let footer = match content.footer.trim() {
        "" => String::new(),
        text => format!("<footer>{}</footer>\n", escape_html(text)),
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
html, body {{ margin: 0; height: 100%; background: #1e1e1e; color: #f0f0f0;
  font-family: "Segoe UI", "Malgun Gothic", sans-serif; }}
main {{ display: flex; flex-direction: column; justify-content: center; align-items: center;
  height: 100%; padding: 0 10%; box-sizing: border-box; text-align: center; }}
h1 {{ font-size: 2.6em; margin-bottom: 0.6em; }}
p {{ font-size: 1.5em; line-height: 1.5; margin: 0.4em 0; }}
footer {{ margin-top: 2em; font-size: 1.1em; color: #a0a0a0; }}
</style>
</head>
<body>
<main>
<h1>{title}</h1>
{paragraphs}{footer}</main>
</body>
</html>
"#
    )
}

/// Screensaver page: the image scaled to fit on black, or a drifting clock
/// when there is no image.
pub fn render_saver_page(image: Option<&Path>) -> String {
    let body = match image {
        Some(path) => format!(r#"<img src="{}" alt="">"#, escape_html(&file_url(path))),
        None => r#"<div id="clock"></div>
<script>
function tick() {
  const el = document.getElementById("clock");
  el.textContent = new Date().toLocaleTimeString();
  el.style.left = (10 + Math.random() * 60) + "%";
  el.style.top = (10 + Math.random() * 70) + "%";
}
tick();
setInterval(tick, 10000);
</script>"#
            .to_string(),
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Screensaver</title>
<style>
html, body {{ margin: 0; height: 100%; background: #000; overflow: hidden; cursor: none; }}
img {{ width: 100%; height: 100%; object-fit: contain; }}
#clock {{ position: absolute; color: #555; font: 4em "Segoe UI", sans-serif; }}
</style>
</head>
<body>
{body}
</body>
</html>
"#
    )
}

pub fn write_page(path: &Path, html: &str) -> Result<()> {
    write_atomic(path, html.as_bytes())
        .with_context(|| format!("Failed to write page {}", path.display()))
}
