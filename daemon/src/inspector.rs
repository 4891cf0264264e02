/// OS-level process and window operations used by the supervisors.
///
/// Process scanning and termination go through `sysinfo` and work on every
/// platform. Window enumeration and show/raise/focus use Win32; on other
/// platforms those calls return [`InspectError::Unsupported`], which callers
/// treat as "no information" rather than "no window".
use std::cell::RefCell;
use std::ffi::OsString;
use std::path::Path;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

/// Opaque top-level window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("window inspection is not supported on this platform")]
    Unsupported,
    #[error("{op} failed for pid {pid}: {reason}")]
    Os {
        op: &'static str,
        pid: u32,
        reason: String,
    },
}

/// Window and process capabilities of the host OS.
pub trait WindowInspector {
    /// Visible top-level windows owned by `pid`.
    fn find_visible_windows(&self, pid: u32) -> Result<Vec<WindowHandle>, InspectError>;
    fn minimize(&self, pid: u32) -> Result<(), InspectError>;
    fn restore(&self, pid: u32) -> Result<(), InspectError>;
    /// Puts the windows of `pid` on top of the z-order and gives them focus.
    fn raise_and_focus(&self, pid: u32) -> Result<(), InspectError>;
    /// Pins (`true`) or unpins (`false`) the windows of `pid` above others.
    fn set_topmost(&self, pid: u32, topmost: bool) -> Result<(), InspectError>;
    /// Force-terminates `pid`. Returns `false` when no such process exists.
    fn terminate(&self, pid: u32) -> bool;
    fn is_alive(&self, pid: u32) -> bool;
    /// Main browser processes started with `--user-data-dir=<dir>`, oldest first.
    fn find_processes_by_profile(&self, dir: &Path) -> Vec<u32>;
    /// Main browser processes started with `--app-id=<id>`, oldest first.
    fn find_processes_by_app_id(&self, id: &str) -> Vec<u32>;
}

/// [`WindowInspector`] backed by `sysinfo` and Win32.
pub struct SystemInspector {
    sys: RefCell<System>,
}

impl SystemInspector {
    pub fn new() -> Self {
        Self {
            sys: RefCell::new(System::new()),
        }
    }

    fn scan(&self, matches: impl Fn(&[OsString]) -> bool) -> Vec<u32> {
        let mut sys = self.sys.borrow_mut();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );
        let mut found: Vec<(u64, u32)> = sys
            .processes()
            .iter()
            .filter(|(_, p)| p.status() != ProcessStatus::Zombie)
            .filter(|(_, p)| !is_helper_process(p.cmd()) && matches(p.cmd()))
            .map(|(pid, p)| (p.start_time(), pid.as_u32()))
            .collect();
        found.sort_unstable();
        found.into_iter().map(|(_, pid)| pid).collect()
    }

    fn refresh_one(&self, pid: u32) {
        self.sys
            .borrow_mut()
            .refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowInspector for SystemInspector {
    fn find_visible_windows(&self, pid: u32) -> Result<Vec<WindowHandle>, InspectError> {
        #[cfg(windows)]
        {
            imp::visible_windows(pid)
        }
        #[cfg(not(windows))]
        {
            let _ = pid;
            Err(InspectError::Unsupported)
        }
    }

    fn minimize(&self, pid: u32) -> Result<(), InspectError> {
        #[cfg(windows)]
        {
            imp::minimize(pid)
        }
        #[cfg(not(windows))]
        {
            let _ = pid;
            Err(InspectError::Unsupported)
        }
    }

    fn restore(&self, pid: u32) -> Result<(), InspectError> {
        #[cfg(windows)]
        {
            imp::restore(pid)
        }
        #[cfg(not(windows))]
        {
            let _ = pid;
            Err(InspectError::Unsupported)
        }
    }

    fn raise_and_focus(&self, pid: u32) -> Result<(), InspectError> {
        #[cfg(windows)]
        {
            imp::raise_and_focus(pid)
        }
        #[cfg(not(windows))]
        {
            let _ = pid;
            Err(InspectError::Unsupported)
        }
    }

    fn set_topmost(&self, pid: u32, topmost: bool) -> Result<(), InspectError> {
        #[cfg(windows)]
        {
            imp::set_topmost(pid, topmost)
        }
        #[cfg(not(windows))]
        {
            let _ = (pid, topmost);
            Err(InspectError::Unsupported)
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        self.refresh_one(pid);
        let sys = self.sys.borrow();
        match sys.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.refresh_one(pid);
        let sys = self.sys.borrow();
        sys.process(Pid::from_u32(pid))
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    fn find_processes_by_profile(&self, dir: &Path) -> Vec<u32> {
        self.scan(|cmd| has_profile_arg(cmd, dir))
    }

    fn find_processes_by_app_id(&self, id: &str) -> Vec<u32> {
        self.scan(|cmd| has_app_id_arg(cmd, id))
    }
}

/// Chromium helper processes (renderer, GPU, utility) share the profile
/// argument of their browser; only the main process is a dedup candidate.
fn is_helper_process(cmd: &[OsString]) -> bool {
    cmd.iter()
        .any(|arg| arg.to_string_lossy().starts_with("--type="))
}

fn has_profile_arg(cmd: &[OsString], dir: &Path) -> bool {
    let wanted = normalize_path_text(&dir.to_string_lossy());
    cmd.iter().any(|arg| {
        arg.to_string_lossy()
            .strip_prefix("--user-data-dir=")
            .is_some_and(|value| normalize_path_text(value) == wanted)
    })
}

fn has_app_id_arg(cmd: &[OsString], id: &str) -> bool {
    cmd.iter().any(|arg| {
        arg.to_string_lossy()
            .strip_prefix("--app-id=")
            .is_some_and(|value| value.trim_matches('"') == id)
    })
}

/// Normalizes quoting, separators and trailing slashes (and case on Windows)
/// so a profile path compares equal however the browser echoes it back.
fn normalize_path_text(raw: &str) -> String {
    let unquoted = raw.trim().trim_matches('"').replace('\\', "/");
    let trimmed = unquoted.trim_end_matches('/');
    if cfg!(windows) {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowThreadProcessId, IsWindowVisible, SetForegroundWindow,
        SetWindowPos, ShowWindow, HWND_NOTOPMOST, HWND_TOPMOST, SWP_NOACTIVATE, SWP_NOMOVE,
        SWP_NOSIZE, SW_MINIMIZE, SW_RESTORE,
    };

    use super::{InspectError, WindowHandle};

    struct Search {
        pid: u32,
        found: Vec<WindowHandle>,
    }

    unsafe extern "system" fn collect_visible(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut Search);
        if IsWindowVisible(hwnd).as_bool() {
            let mut owner = 0u32;
            GetWindowThreadProcessId(hwnd, Some(&mut owner as *mut u32));
            if owner == search.pid {
                search.found.push(WindowHandle(hwnd.0 as isize));
            }
        }
        BOOL(1)
    }

    fn to_hwnd(handle: WindowHandle) -> HWND {
        HWND(handle.0 as _)
    }

    pub fn visible_windows(pid: u32) -> Result<Vec<WindowHandle>, InspectError> {
        let mut search = Search {
            pid,
            found: Vec::new(),
        };
        unsafe {
            EnumWindows(
                Some(collect_visible),
                LPARAM(&mut search as *mut Search as isize),
            )
        }
        .map_err(|e| InspectError::Os {
            op: "EnumWindows",
            pid,
            reason: e.to_string(),
        })?;
        Ok(search.found)
    }

    pub fn minimize(pid: u32) -> Result<(), InspectError> {
        for handle in visible_windows(pid)? {
            unsafe {
                let _ = ShowWindow(to_hwnd(handle), SW_MINIMIZE);
            }
        }
        Ok(())
    }

    pub fn restore(pid: u32) -> Result<(), InspectError> {
        for handle in visible_windows(pid)? {
            unsafe {
                let _ = ShowWindow(to_hwnd(handle), SW_RESTORE);
            }
        }
        Ok(())
    }

    pub fn raise_and_focus(pid: u32) -> Result<(), InspectError> {
        for handle in visible_windows(pid)? {
            let hwnd = to_hwnd(handle);
            unsafe {
                SetWindowPos(hwnd, HWND_TOPMOST, 0, 0, 0, 0, SWP_NOMOVE | SWP_NOSIZE).map_err(
                    |e| InspectError::Os {
                        op: "SetWindowPos",
                        pid,
                        reason: e.to_string(),
                    },
                )?;
                // Focus can be refused by the foreground lock; the z-order
                // change above still applies.
                let _ = SetForegroundWindow(hwnd);
            }
        }
        Ok(())
    }

    pub fn set_topmost(pid: u32, topmost: bool) -> Result<(), InspectError> {
        let insert_after = if topmost { HWND_TOPMOST } else { HWND_NOTOPMOST };
        for handle in visible_windows(pid)? {
            unsafe {
                SetWindowPos(
                    to_hwnd(handle),
                    insert_after,
                    0,
                    0,
                    0,
                    0,
                    SWP_NOMOVE | SWP_NOSIZE | SWP_NOACTIVATE,
                )
                .map_err(|e| InspectError::Os {
                    op: "SetWindowPos",
                    pid,
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}
