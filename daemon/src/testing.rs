//! In-memory OS used by the supervisor tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::inspector::{InspectError, WindowHandle, WindowInspector};
use crate::launcher::{LaunchError, LaunchRequest, ProcessHandle, ProcessLauncher};

#[derive(Debug, Clone, Default)]
pub struct FakeProcess {
    pub profile: Option<PathBuf>,
    pub app_id: Option<String>,
    pub windows: usize,
    pub minimized: bool,
    pub topmost: bool,
    pub focused: bool,
    /// Killed but not yet gone from the process table.
    pub exiting: bool,
}

/// A process table plus window state. Launches add processes with
/// `launch_windows` visible windows, or fail while `fail_launches` is set.
#[derive(Debug)]
pub struct FakeOs {
    procs: RefCell<BTreeMap<u32, FakeProcess>>,
    next_pid: Cell<u32>,
    pub launches: RefCell<Vec<LaunchRequest>>,
    pub fail_launches: Cell<bool>,
    pub launch_windows: Cell<usize>,
    pub windows_supported: Cell<bool>,
    /// When set, `terminate` only marks the process as exiting; it stays
    /// listed until [`FakeOs::reap`].
    pub deferred_kills: Cell<bool>,
}

impl Default for FakeOs {
    fn default() -> Self {
        Self {
            procs: RefCell::new(BTreeMap::new()),
            next_pid: Cell::new(1000),
            launches: RefCell::new(Vec::new()),
            fail_launches: Cell::new(false),
            launch_windows: Cell::new(1),
            windows_supported: Cell::new(true),
            deferred_kills: Cell::new(false),
        }
    }
}

impl FakeOs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an externally started process using `profile`.
    pub fn spawn_external(&self, profile: &Path, windows: usize) -> u32 {
        let pid = self.alloc_pid();
        self.procs.borrow_mut().insert(
            pid,
            FakeProcess {
                profile: Some(profile.to_path_buf()),
                windows,
                ..FakeProcess::default()
            },
        );
        pid
    }

    pub fn set_windows(&self, pid: u32, windows: usize) {
        if let Some(p) = self.procs.borrow_mut().get_mut(&pid) {
            p.windows = windows;
        }
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, pid: u32) {
        self.procs.borrow_mut().remove(&pid);
    }

    /// Removes every process killed while `deferred_kills` was set.
    pub fn reap(&self) {
        self.procs.borrow_mut().retain(|_, p| !p.exiting);
    }

    pub fn process(&self, pid: u32) -> Option<FakeProcess> {
        self.procs.borrow().get(&pid).cloned()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        self.procs.borrow().keys().copied().collect()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.borrow().len()
    }

    fn alloc_pid(&self) -> u32 {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        pid
    }

    fn with_proc<T>(
        &self,
        pid: u32,
        f: impl FnOnce(&mut FakeProcess) -> T,
    ) -> Result<T, InspectError> {
        if !self.windows_supported.get() {
            return Err(InspectError::Unsupported);
        }
        let mut procs = self.procs.borrow_mut();
        let p = procs.get_mut(&pid).ok_or(InspectError::Os {
            op: "fake",
            pid,
            reason: "no such process".into(),
        })?;
        Ok(f(p))
    }
}

impl WindowInspector for FakeOs {
    fn find_visible_windows(&self, pid: u32) -> Result<Vec<WindowHandle>, InspectError> {
        if !self.windows_supported.get() {
            return Err(InspectError::Unsupported);
        }
        let procs = self.procs.borrow();
        let count = procs.get(&pid).map_or(0, |p| p.windows);
        Ok((0..count)
            .map(|i| WindowHandle((pid as isize) * 100 + i as isize))
            .collect())
    }

    fn minimize(&self, pid: u32) -> Result<(), InspectError> {
        self.with_proc(pid, |p| {
            p.minimized = true;
            p.focused = false;
        })
    }

    fn restore(&self, pid: u32) -> Result<(), InspectError> {
        self.with_proc(pid, |p| p.minimized = false)
    }

    fn raise_and_focus(&self, pid: u32) -> Result<(), InspectError> {
        self.with_proc(pid, |p| {
            p.topmost = true;
            p.focused = true;
        })
    }

    fn set_topmost(&self, pid: u32, topmost: bool) -> Result<(), InspectError> {
        self.with_proc(pid, |p| p.topmost = topmost)
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut procs = self.procs.borrow_mut();
        if !self.deferred_kills.get() {
            return procs.remove(&pid).is_some();
        }
        match procs.get_mut(&pid) {
            Some(p) => {
                p.exiting = true;
                true
            }
            None => false,
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.procs.borrow().contains_key(&pid)
    }

    fn find_processes_by_profile(&self, dir: &Path) -> Vec<u32> {
        self.procs
            .borrow()
            .iter()
            .filter(|(_, p)| p.profile.as_deref() == Some(dir))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn find_processes_by_app_id(&self, id: &str) -> Vec<u32> {
        self.procs
            .borrow()
            .iter()
            .filter(|(_, p)| p.app_id.as_deref() == Some(id))
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl ProcessLauncher for FakeOs {
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError> {
        self.launches.borrow_mut().push(request.clone());
        if self.fail_launches.get() {
            return Err(LaunchError::Spawn {
                exe: PathBuf::from("fake-browser"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake failure"),
            });
        }
        let pid = self.alloc_pid();
        self.procs.borrow_mut().insert(
            pid,
            FakeProcess {
                profile: Some(request.profile_dir.clone()),
                app_id: request.app_id.clone(),
                windows: self.launch_windows.get(),
                ..FakeProcess::default()
            },
        );
        Ok(ProcessHandle::spawned_pid(pid))
    }
}
