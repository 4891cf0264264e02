/// Role workers and the loop that drives them.
///
/// Each role runs in its own process: [`run`] owns the tick timer, config
/// reloads and Ctrl+C, and calls into one [`Worker`] per tick.
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{self, secs, ConfigSnapshot, ConfigStore, Role, SaverConfig, SaverImageMode, WindowMode};
use crate::coordination::{now_millis, CoordinationState, CoordinationStore};
use crate::event::WorkerEvent;
use crate::idle::{IdleMonitor, IdleSource, SaverState};
use crate::inspector::WindowInspector;
use crate::launcher::ProcessLauncher;
use crate::notice::{NoticeContent, NoticeCoordinator};
use crate::overlay::{self, BrowserOverlay, OverlayEvent, OverlayState};
use crate::paths::WorkPaths;
use crate::supervisor::{AudioPolicy, RoleSupervisor, TargetPolicy};

const NOTICE_SURFACE: &str = "notice";
const SAVER_SURFACE: &str = "saver";

pub trait Worker {
    fn role(&self) -> Role;
    fn tick(&mut self, now: Instant, config: &ConfigSnapshot);
    /// Called once on the way out. Role browsers stay running.
    fn shutdown(&mut self, config: &ConfigSnapshot);
}

/// OS services shared by the parts of one worker.
#[derive(Clone)]
pub struct Host {
    pub launcher: Rc<dyn ProcessLauncher>,
    pub inspector: Rc<dyn WindowInspector>,
}

// ── Audio ─────────────────────────────────────────────────────────────────────

pub struct AudioWorker {
    host: Host,
    supervisor: RoleSupervisor<AudioPolicy>,
}

impl AudioWorker {
    pub fn new(host: Host, paths: WorkPaths, config: &ConfigSnapshot) -> Self {
        Self {
            host,
            supervisor: RoleSupervisor::new(AudioPolicy, paths, config),
        }
    }
}

impl Worker for AudioWorker {
    fn role(&self) -> Role {
        Role::Audio
    }

    fn tick(&mut self, now: Instant, config: &ConfigSnapshot) {
        let outcome = self
            .supervisor
            .tick(now, config, &*self.host.launcher, &*self.host.inspector);
        debug!(?outcome, "audio tick");
    }

    fn shutdown(&mut self, _config: &ConfigSnapshot) {
        if let Some(pid) = self.supervisor.release() {
            info!(pid, "Leaving audio browser running");
        }
    }
}

// ── Target (+ notice) ─────────────────────────────────────────────────────────

pub struct TargetWorker {
    host: Host,
    paths: WorkPaths,
    coordination: CoordinationStore,
    supervisor: RoleSupervisor<TargetPolicy>,
    notice: NoticeCoordinator,
    notice_overlay: BrowserOverlay,
    /// Content currently written to the notice page.
    notice_page: Option<NoticeContent>,
    last_refocus_at: Option<Instant>,
    /// Target pid we last made topmost.
    pinned: Option<u32>,
}

impl TargetWorker {
    pub fn new(host: Host, paths: WorkPaths, config: &ConfigSnapshot) -> Self {
        let coordination = CoordinationStore::new(paths.coordination_dir());
        let notice = NoticeCoordinator::new(&coordination.load());
        if notice.is_dismissed() {
            info!("Notice was dismissed before restart");
        }
        let notice_overlay = BrowserOverlay::new(
            NOTICE_SURFACE,
            &paths.surface_page(NOTICE_SURFACE),
            paths.profile_dir(NOTICE_SURFACE),
        );
        Self {
            host,
            supervisor: RoleSupervisor::new(TargetPolicy, paths.clone(), config),
            paths,
            coordination,
            notice,
            notice_overlay,
            notice_page: None,
            last_refocus_at: None,
            pinned: None,
        }
    }

    fn tick_notice(&mut self, now: Instant, config: &ConfigSnapshot, state: &CoordinationState) {
        let inspector = &*self.host.inspector;
        let now_ms = now_millis();
        self.notice.tick(now, now_ms, config, state);

        if !config.notice_active() {
            if self.notice_overlay.pid().is_some() {
                self.notice_overlay.stop(inspector);
            }
            return;
        }

        let content = &self.notice.window().content;
        if self.notice_page.as_ref() != Some(content) {
            let page = self.paths.surface_page(NOTICE_SURFACE);
            match overlay::write_page(&page, &overlay::render_notice_page(content)) {
                Ok(()) => {
                    info!("Notice page updated");
                    self.notice_page = Some(content.clone());
                    self.notice_overlay.reload(inspector);
                }
                Err(e) => {
                    warn!("{e:#}");
                    return;
                }
            }
        }

        let window = self.notice.window();
        let desired = OverlayState {
            visible: window.visible,
            locked: window.interaction_locked,
        };
        let event = self
            .notice_overlay
            .reconcile(now, desired, &*self.host.launcher, inspector);
        if event == OverlayEvent::ClosedByUser {
            self.notice.dismiss(now_ms);
            if let Err(e) = self.coordination.record_notice_dismissed(now_ms) {
                warn!("Failed to persist notice dismissal: {e:#}");
            }
        }
    }

    fn refocus_target(&mut self, now: Instant, config: &ConfigSnapshot, state: &CoordinationState) {
        let inspector = &*self.host.inspector;
        let Some(pid) = self.supervisor.canonical_pid() else {
            self.pinned = None;
            return;
        };
        let interval = secs(config.target.refocus_interval_sec);
        let suppressed = interval.is_zero()
            || config.target.window_mode == WindowMode::Minimized
            || state.ui_active()
            || state.saver_active
            || self.notice.window().visible;
        if suppressed {
            if self.pinned.take() == Some(pid) {
                if let Err(e) = inspector.set_topmost(pid, false) {
                    debug!(pid, "Failed to unpin target: {e}");
                }
            }
            return;
        }
        if self
            .last_refocus_at
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
        {
            return;
        }
        self.last_refocus_at = Some(now);
        match inspector.raise_and_focus(pid) {
            Ok(()) => self.pinned = Some(pid),
            Err(e) => debug!(pid, "Refocus skipped: {e}"),
        }
    }
}

impl Worker for TargetWorker {
    fn role(&self) -> Role {
        Role::Target
    }

    fn tick(&mut self, now: Instant, config: &ConfigSnapshot) {
        let outcome = self
            .supervisor
            .tick(now, config, &*self.host.launcher, &*self.host.inspector);
        debug!(?outcome, "target tick");

        let state = self.coordination.load();
        self.tick_notice(now, config, &state);
        self.refocus_target(now, config, &state);
    }

    fn shutdown(&mut self, _config: &ConfigSnapshot) {
        self.notice_overlay.stop(&*self.host.inspector);
        if let Some(pid) = self.supervisor.release() {
            info!(pid, "Leaving target browser running");
        }
    }
}

// ── Screensaver ───────────────────────────────────────────────────────────────

pub struct SaverWorker {
    host: Host,
    paths: WorkPaths,
    coordination: CoordinationStore,
    idle: Box<dyn IdleSource>,
    monitor: IdleMonitor,
    overlay: BrowserOverlay,
    /// State last written to the coordination files.
    published: Option<SaverState>,
    /// Image currently rendered into the saver page.
    page_image: Option<Option<PathBuf>>,
}

impl SaverWorker {
    pub fn new(host: Host, paths: WorkPaths, idle: Box<dyn IdleSource>, started_at: Instant) -> Self {
        let overlay = BrowserOverlay::new(
            SAVER_SURFACE,
            &paths.surface_page(SAVER_SURFACE),
            paths.profile_dir(SAVER_SURFACE),
        );
        Self {
            host,
            coordination: CoordinationStore::new(paths.coordination_dir()),
            paths,
            idle,
            monitor: IdleMonitor::new(started_at),
            overlay,
            published: None,
            page_image: None,
        }
    }

    fn publish(&mut self, state: SaverState) {
        if self.published == Some(state) {
            return;
        }
        match self
            .coordination
            .set_saver_active(state == SaverState::Visible, now_millis())
        {
            Ok(()) => self.published = Some(state),
            // Retried next tick.
            Err(e) => warn!("Failed to publish screensaver state: {e:#}"),
        }
    }

    fn sync_page(&mut self, config: &SaverConfig) -> bool {
        let image = resolve_saver_image(config, &self.paths);
        if self.page_image.as_ref() == Some(&image) {
            return true;
        }
        if image.is_none() && config.image_mode != SaverImageMode::Generated {
            warn!(mode = ?config.image_mode, "Screensaver image missing, using placeholder");
        }
        let page = self.paths.surface_page(SAVER_SURFACE);
        match overlay::write_page(&page, &overlay::render_saver_page(image.as_deref())) {
            Ok(()) => {
                self.overlay.reload(&*self.host.inspector);
                self.page_image = Some(image);
                true
            }
            Err(e) => {
                warn!("{e:#}");
                false
            }
        }
    }
}

impl Worker for SaverWorker {
    fn role(&self) -> Role {
        Role::Saver
    }

    fn tick(&mut self, now: Instant, config: &ConfigSnapshot) {
        let idle = self.idle.idle_duration();
        self.monitor.tick(now, &config.saver, idle);
        let state = self.monitor.state();
        self.publish(state);

        if !config.saver.enabled {
            if self.overlay.pid().is_some() {
                self.overlay.stop(&*self.host.inspector);
            }
            return;
        }
        if !self.sync_page(&config.saver) {
            return;
        }
        let visible = state == SaverState::Visible;
        let desired = OverlayState {
            visible,
            locked: visible,
        };
        let event = self.overlay.reconcile(
            now,
            desired,
            &*self.host.launcher,
            &*self.host.inspector,
        );
        if event == OverlayEvent::ClosedByUser {
            debug!("Screensaver closed, reopening while still idle");
        }
    }

    fn shutdown(&mut self, _config: &ConfigSnapshot) {
        self.overlay.stop(&*self.host.inspector);
        if let Err(e) = self.coordination.set_saver_active(false, now_millis()) {
            warn!("Failed to clear screensaver state: {e:#}");
        }
    }
}

/// The picture the screensaver page shows, if any exists on disk.
pub fn resolve_saver_image(config: &SaverConfig, paths: &WorkPaths) -> Option<PathBuf> {
    let candidate = match config.image_mode {
        SaverImageMode::Bundled => Some(paths.bundled_saver_image()),
        SaverImageMode::Path => config.image_path.clone(),
        SaverImageMode::Generated => None,
    };
    candidate.filter(|p| p.is_file())
}

// ── Loop ──────────────────────────────────────────────────────────────────────

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Runs `worker` until Ctrl+C, reloading the config whenever its file changes.
pub async fn run(worker: Box<dyn Worker>, mut store: ConfigStore) {
    let config = store.load();
    let (tx, rx) = mpsc::channel::<WorkerEvent>(16);

    tokio::spawn(config::watch_config(store, tx.clone()));
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(WorkerEvent::Shutdown).await;
            }
        });
    }

    run_loop(worker, config, rx).await;
    drop(tx);
}

/// The tick/reload/shutdown loop, separated from signal and watcher setup.
pub async fn run_loop(
    mut worker: Box<dyn Worker>,
    mut config: ConfigSnapshot,
    mut rx: mpsc::Receiver<WorkerEvent>,
) {
    let mut period = config.poll_interval();
    let mut ticks = ticker(period);
    info!(role = %worker.role(), ?period, "Worker started");

    loop {
        tokio::select! {
            _ = ticks.tick() => worker.tick(Instant::now(), &config),
            event = rx.recv() => match event {
                Some(WorkerEvent::ConfigReloaded(next)) => {
                    if next.poll_interval() != period {
                        period = next.poll_interval();
                        info!(?period, "Poll interval changed");
                        ticks = ticker(period);
                    }
                    config = next;
                }
                Some(WorkerEvent::Shutdown) | None => break,
            },
        }
    }

    info!(role = %worker.role(), "Worker shutting down");
    worker.shutdown(&config);
}
