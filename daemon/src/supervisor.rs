/// Role supervision: a launch scheduler plus a window watchdog, parameterized
/// by a [`RolePolicy`] that maps the config snapshot to per-role settings.
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{secs, ConfigSnapshot, Role, WindowMode};
use crate::inspector::WindowInspector;
use crate::launcher::{LaunchRequest, ProcessLauncher};
use crate::paths::WorkPaths;
use crate::schedule::{LaunchScheduler, RoleIdentity, RoleSettings, TickOutcome};
use crate::watchdog::{WatchdogVerdict, WindowWatchdog};

/// Role-specific reading of the config.
pub trait RolePolicy {
    fn role(&self) -> Role;
    fn settings(&self, config: &ConfigSnapshot, paths: &WorkPaths) -> RoleSettings;
}

/// Background media. Never takes over the screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioPolicy;

impl RolePolicy for AudioPolicy {
    fn role(&self) -> Role {
        Role::Audio
    }

    fn settings(&self, config: &ConfigSnapshot, paths: &WorkPaths) -> RoleSettings {
        let audio = &config.audio;
        let mode = match audio.window_mode {
            WindowMode::Fullscreen | WindowMode::Kiosk => {
                debug!(mode = ?audio.window_mode, "audio surface cannot cover the screen, minimizing");
                WindowMode::Minimized
            }
            mode => mode,
        };
        let profile_dir = paths.profile_dir(Role::Audio.as_str());
        RoleSettings {
            enabled: audio.enabled,
            request: LaunchRequest {
                urls: audio.urls.clone(),
                profile_dir: profile_dir.clone(),
                mode,
                autoplay: audio.autoplay,
                isolate_background: audio.isolate_background,
                app_id: audio.app_id.clone(),
            },
            start_delay: secs(audio.start_delay_sec),
            cooldown: secs(audio.relaunch_cooldown_sec),
            repeat: audio.repeat,
            identity: identity(audio.app_id.as_deref(), profile_dir),
        }
    }
}

/// The primary kiosk page.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetPolicy;

impl RolePolicy for TargetPolicy {
    fn role(&self) -> Role {
        Role::Target
    }

    fn settings(&self, config: &ConfigSnapshot, paths: &WorkPaths) -> RoleSettings {
        let target = &config.target;
        let profile_dir = paths.profile_dir(Role::Target.as_str());
        RoleSettings {
            enabled: target.enabled,
            request: LaunchRequest {
                urls: target.urls.clone(),
                profile_dir: profile_dir.clone(),
                mode: target.window_mode,
                autoplay: target.autoplay,
                isolate_background: target.isolate_background,
                app_id: target.app_id.clone(),
            },
            start_delay: secs(target.start_delay_sec),
            cooldown: secs(target.relaunch_cooldown_sec),
            repeat: target.repeat,
            identity: identity(target.app_id.as_deref(), profile_dir),
        }
    }
}

fn identity(app_id: Option<&str>, profile_dir: std::path::PathBuf) -> RoleIdentity {
    match app_id {
        Some(id) if !id.is_empty() => RoleIdentity::AppId(id.to_string()),
        _ => RoleIdentity::Profile(profile_dir),
    }
}

pub struct RoleSupervisor<P> {
    policy: P,
    paths: WorkPaths,
    scheduler: LaunchScheduler,
    watchdog: WindowWatchdog,
}

impl<P: RolePolicy> RoleSupervisor<P> {
    pub fn new(policy: P, paths: WorkPaths, config: &ConfigSnapshot) -> Self {
        let role = policy.role();
        Self {
            policy,
            paths,
            scheduler: LaunchScheduler::new(role),
            watchdog: WindowWatchdog::new(config.watchdog_grace()),
        }
    }

    pub fn role(&self) -> Role {
        self.policy.role()
    }

    pub fn canonical_pid(&self) -> Option<u32> {
        self.scheduler.canonical_pid()
    }

    pub fn tick(
        &mut self,
        now: Instant,
        config: &ConfigSnapshot,
        launcher: &dyn ProcessLauncher,
        inspector: &dyn WindowInspector,
    ) -> TickOutcome {
        let settings = self.policy.settings(config, &self.paths);
        let outcome = self.scheduler.tick(now, &settings, launcher, inspector);

        self.watchdog.set_grace(config.watchdog_grace());
        let verdict = self
            .watchdog
            .check(now, self.scheduler.canonical_pid(), inspector);
        if verdict == WatchdogVerdict::Expired {
            warn!(role = %self.role(), "Window gone past grace period, recycling");
            self.scheduler.recycle(inspector);
        }
        outcome
    }

    /// Lets go of the canonical process without stopping it.
    pub fn release(&mut self) -> Option<u32> {
        self.scheduler.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOs;
    use std::time::Duration;

    fn paths() -> WorkPaths {
        WorkPaths::new("/w")
    }

    fn audio_config() -> ConfigSnapshot {
        let mut c = ConfigSnapshot::default();
        c.audio.enabled = true;
        c.audio.urls = vec!["https://www.youtube.com/watch?v=abc".into()];
        c.audio.start_delay_sec = 0.0;
        c
    }

    #[test]
    fn audio_never_covers_the_screen() {
        let mut c = audio_config();
        for mode in [WindowMode::Fullscreen, WindowMode::Kiosk] {
            c.audio.window_mode = mode;
            assert_eq!(AudioPolicy.settings(&c, &paths()).request.mode, WindowMode::Minimized);
        }
        c.audio.window_mode = WindowMode::Normal;
        assert_eq!(AudioPolicy.settings(&c, &paths()).request.mode, WindowMode::Normal);
    }

    #[test]
    fn app_id_selects_identity() {
        let mut c = ConfigSnapshot::default();
        assert_eq!(
            TargetPolicy.settings(&c, &paths()).identity,
            RoleIdentity::Profile(paths().profile_dir("target"))
        );
        c.target.app_id = Some("kiosk".into());
        assert_eq!(
            TargetPolicy.settings(&c, &paths()).identity,
            RoleIdentity::AppId("kiosk".into())
        );
    }

    #[test]
    fn roles_use_separate_profiles() {
        let c = audio_config();
        let audio = AudioPolicy.settings(&c, &paths());
        let target = TargetPolicy.settings(&c, &paths());
        assert_ne!(audio.request.profile_dir, target.request.profile_dir);
    }

    #[test]
    fn vanished_window_recycles_and_relaunches() {
        let os = FakeOs::new();
        let mut c = ConfigSnapshot::default();
        c.target.start_delay_sec = 0.0;
        c.target.relaunch_cooldown_sec = 5.0;
        let mut sup = RoleSupervisor::new(TargetPolicy, paths(), &c);
        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);

        let TickOutcome::Launched(first) = sup.tick(t0, &c, &os, &os) else {
            panic!("expected launch");
        };
        os.set_windows(first, 0);
        assert_eq!(sup.tick(at(500), &c, &os, &os), TickOutcome::Running(first));
        assert_eq!(sup.tick(at(2_400), &c, &os, &os), TickOutcome::Running(first));
        assert!(os.process(first).is_some());

        // Grace (2 s) spent: killed in this tick.
        sup.tick(at(2_500), &c, &os, &os);
        assert!(os.process(first).is_none());
        assert_eq!(sup.canonical_pid(), None);

        // Relaunch waits for the cooldown from the first launch.
        assert_eq!(sup.tick(at(4_000), &c, &os, &os), TickOutcome::Waiting);
        assert!(matches!(sup.tick(at(5_000), &c, &os, &os), TickOutcome::Launched(p) if p != first));
    }

    #[test]
    fn window_returning_within_grace_keeps_process() {
        let os = FakeOs::new();
        let mut c = ConfigSnapshot::default();
        c.target.start_delay_sec = 0.0;
        let mut sup = RoleSupervisor::new(TargetPolicy, paths(), &c);
        let t0 = Instant::now();

        let TickOutcome::Launched(pid) = sup.tick(t0, &c, &os, &os) else {
            panic!("expected launch");
        };
        os.set_windows(pid, 0);
        sup.tick(t0 + Duration::from_millis(100), &c, &os, &os);
        os.set_windows(pid, 1);
        sup.tick(t0 + Duration::from_millis(1_500), &c, &os, &os);
        os.set_windows(pid, 0);
        assert_eq!(
            sup.tick(t0 + Duration::from_millis(3_000), &c, &os, &os),
            TickOutcome::Running(pid)
        );
        assert_eq!(os.launch_count(), 1);
    }

    #[test]
    fn release_leaves_process_running() {
        let os = FakeOs::new();
        let c = audio_config();
        let mut sup = RoleSupervisor::new(AudioPolicy, paths(), &c);
        let TickOutcome::Launched(pid) = sup.tick(Instant::now(), &c, &os, &os) else {
            panic!("expected launch");
        };
        assert_eq!(sup.release(), Some(pid));
        assert!(os.process(pid).is_some());
    }
}
