/// Launch scheduling for one supervised role.
///
/// Each tick the scheduler makes exactly one decision: leave the running
/// process alone, adopt a process found by an OS scan, schedule a launch, or
/// launch now. Adoption always wins over launching, which is what keeps a
/// role at one process across worker restarts and external launches.
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{RepeatPolicy, Role, WindowMode};
use crate::inspector::WindowInspector;
use crate::launcher::{LaunchRequest, ProcessHandle, ProcessLauncher};

/// How the OS processes of a role are recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleIdentity {
    Profile(PathBuf),
    AppId(String),
}

/// Per-tick settings of a role, derived from the config snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSettings {
    pub enabled: bool,
    pub request: LaunchRequest,
    pub start_delay: Duration,
    pub cooldown: Duration,
    pub repeat: RepeatPolicy,
    pub identity: RoleIdentity,
}

impl RoleSettings {
    pub fn signature(&self) -> LaunchSignature {
        LaunchSignature {
            urls: self.request.urls.clone(),
            mode: self.request.mode,
            start_delay: self.start_delay,
            cooldown: self.cooldown,
            enabled: self.enabled,
            repeat: self.repeat,
        }
    }
}

/// The config fields whose change forces a stop-and-relaunch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSignature {
    urls: Vec<String>,
    mode: WindowMode,
    start_delay: Duration,
    cooldown: Duration,
    enabled: bool,
    repeat: RepeatPolicy,
}

/// Timing state owned by one scheduler.
///
/// `pending_launch_at` is only set while no live process is known, and is
/// cleared as soon as a launch is attempted or a process is adopted.
#[derive(Debug, Default, Clone)]
pub struct LaunchSchedule {
    /// `None` = never launched in this epoch, so the cooldown is satisfied.
    pub last_launch_at: Option<Instant>,
    pub pending_launch_at: Option<Instant>,
    pub once_launched: bool,
    pub last_signature: Option<LaunchSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    Running(u32),
    Adopted(u32),
    /// Nothing to do until the cooldown or start delay elapses.
    Waiting,
    /// `once` policy already satisfied for this epoch.
    OnceDone,
    Launched(u32),
    LaunchFailed,
}

pub struct LaunchScheduler {
    role: Role,
    schedule: LaunchSchedule,
    canonical: Option<ProcessHandle>,
    /// Pids this scheduler killed that the OS may still list for a while.
    retiring: Vec<u32>,
    disabled_swept: bool,
}

impl LaunchScheduler {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            schedule: LaunchSchedule::default(),
            canonical: None,
            retiring: Vec::new(),
            disabled_swept: false,
        }
    }

    #[cfg(test)]
    pub fn schedule(&self) -> &LaunchSchedule {
        &self.schedule
    }

    pub fn canonical_pid(&self) -> Option<u32> {
        self.canonical.as_ref().map(ProcessHandle::pid)
    }

    /// Kills the canonical process and forgets it, re-arming the launch path.
    pub fn recycle(&mut self, inspector: &dyn WindowInspector) {
        if let Some(handle) = self.canonical.take() {
            info!(role = %self.role, pid = handle.pid(), origin = ?handle.origin(), "Recycling process");
            self.retiring.push(handle.pid());
            handle.terminate(inspector);
        }
    }

    /// Forgets the canonical process without killing it, so a later worker
    /// instance can adopt it.
    pub fn release(&mut self) -> Option<u32> {
        self.canonical.take().map(|h| h.pid())
    }

    pub fn tick(
        &mut self,
        now: Instant,
        settings: &RoleSettings,
        launcher: &dyn ProcessLauncher,
        inspector: &dyn WindowInspector,
    ) -> TickOutcome {
        // 1. A relevant config change starts a new epoch.
        let signature = settings.signature();
        match &self.schedule.last_signature {
            None => self.schedule.last_signature = Some(signature),
            Some(previous) if *previous != signature => {
                info!(role = %self.role, "Launch settings changed");
                self.schedule.last_signature = Some(signature);
                self.schedule.once_launched = false;
                if self.canonical_alive(inspector) {
                    self.recycle(inspector);
                    self.schedule.pending_launch_at = Some(now + settings.start_delay);
                    self.schedule.last_launch_at = None;
                }
            }
            Some(_) => {}
        }

        // 2. Disabled roles keep nothing running.
        if !settings.enabled {
            if let Some(handle) = self.canonical.take() {
                info!(role = %self.role, pid = handle.pid(), "Role disabled, stopping");
                self.retiring.push(handle.pid());
                handle.terminate(inspector);
            }
            if !self.disabled_swept {
                for pid in find_role_processes(&settings.identity, inspector) {
                    info!(role = %self.role, pid, "Role disabled, stopping stray process");
                    self.retiring.push(pid);
                    inspector.terminate(pid);
                }
                self.disabled_swept = true;
            }
            self.schedule.pending_launch_at = None;
            self.schedule.once_launched = false;
            return TickOutcome::Disabled;
        }
        self.disabled_swept = false;

        if let Some(pid) = self.canonical_alive_pid(inspector) {
            return TickOutcome::Running(pid);
        }

        // 3. Adopt an existing instance rather than launching a duplicate.
        // A process we killed can outlive the kill call; it is never adopted.
        self.retiring.retain(|&pid| inspector.is_alive(pid));
        let mut found = find_role_processes(&settings.identity, inspector);
        found.retain(|pid| !self.retiring.contains(pid));
        if let Some(pid) = dedup(&found, inspector) {
            info!(role = %self.role, pid, "Adopting running process");
            self.canonical = Some(ProcessHandle::adopted(pid));
            self.schedule.last_launch_at = Some(now);
            self.schedule.pending_launch_at = None;
            self.schedule.once_launched = true;
            return TickOutcome::Adopted(pid);
        }

        // 4. `once` roles never relaunch within an epoch.
        if settings.repeat == RepeatPolicy::Once && self.schedule.once_launched {
            return TickOutcome::OnceDone;
        }

        // 5. Schedule once the cooldown has elapsed.
        let cooled_down = self
            .schedule
            .last_launch_at
            .map_or(true, |at| now.saturating_duration_since(at) >= settings.cooldown);
        if cooled_down && self.schedule.pending_launch_at.is_none() {
            debug!(role = %self.role, delay = ?settings.start_delay, "Launch scheduled");
            self.schedule.pending_launch_at = Some(now + settings.start_delay);
        }

        // 6. Launch when due.
        match self.schedule.pending_launch_at {
            Some(due) if now >= due => {
                self.schedule.pending_launch_at = None;
                self.schedule.last_launch_at = Some(now);
                match launcher.launch(&settings.request) {
                    Ok(handle) => {
                        let pid = handle.pid();
                        info!(role = %self.role, pid, "Launched");
                        self.canonical = Some(handle);
                        self.schedule.once_launched = true;
                        TickOutcome::Launched(pid)
                    }
                    Err(e) => {
                        warn!(role = %self.role, "Launch failed, retrying after cooldown: {e}");
                        TickOutcome::LaunchFailed
                    }
                }
            }
            _ => TickOutcome::Waiting,
        }
    }

    fn canonical_alive(&mut self, inspector: &dyn WindowInspector) -> bool {
        self.canonical_alive_pid(inspector).is_some()
    }

    /// Returns the canonical pid if it is still running, dropping a dead handle.
    fn canonical_alive_pid(&mut self, inspector: &dyn WindowInspector) -> Option<u32> {
        let handle = self.canonical.as_mut()?;
        if handle.is_alive(inspector) {
            return Some(handle.pid());
        }
        info!(role = %self.role, pid = handle.pid(), origin = ?handle.origin(), "Process exited");
        self.canonical = None;
        None
    }
}

pub fn find_role_processes(identity: &RoleIdentity, inspector: &dyn WindowInspector) -> Vec<u32> {
    match identity {
        RoleIdentity::Profile(dir) => inspector.find_processes_by_profile(dir),
        RoleIdentity::AppId(id) => inspector.find_processes_by_app_id(id),
    }
}

/// Keeps one of `candidates` and terminates the rest: the first one with a
/// visible window, else the first one.
pub fn dedup(candidates: &[u32], inspector: &dyn WindowInspector) -> Option<u32> {
    let first = *candidates.first()?;
    let keep = candidates
        .iter()
        .copied()
        .find(|&pid| {
            inspector
                .find_visible_windows(pid)
                .is_ok_and(|windows| !windows.is_empty())
        })
        .unwrap_or(first);
    for &pid in candidates.iter().filter(|&&pid| pid != keep) {
        warn!(pid, keep, "Terminating duplicate process");
        inspector.terminate(pid);
    }
    Some(keep)
}
