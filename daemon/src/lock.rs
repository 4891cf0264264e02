/// One worker per role.
///
/// A role lock is a file holding the owner's pid. A lock whose owner is no
/// longer a running worker is stale and gets reclaimed, which covers workers
/// killed without a chance to clean up.
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Role;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("a {role} worker is already running (pid {pid})")]
    Held { role: Role, pid: u32 },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the lifetime of a worker; removes its file on drop.
#[derive(Debug)]
pub struct RoleLock {
    path: PathBuf,
    pid: u32,
}

impl RoleLock {
    /// Takes the lock at `path`. `is_live_owner` decides whether a recorded
    /// pid still belongs to a running worker.
    pub fn acquire(
        path: &Path,
        role: Role,
        is_live_owner: impl Fn(u32) -> bool,
    ) -> Result<Self, LockError> {
        let own = std::process::id();
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        match read_owner(path) {
            Some(owner) if owner != own && is_live_owner(owner) => {
                return Err(LockError::Held { role, pid: owner });
            }
            _ if path.exists() => {
                info!(%role, "Reclaiming stale lock");
                remove_stale(path).map_err(io_err)?;
            }
            _ => {}
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            // Another worker won the race between our check and create.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(match read_owner(path) {
                    Some(pid) => LockError::Held { role, pid },
                    None => io_err(e),
                });
            }
            Err(e) => return Err(io_err(e)),
        };
        write!(file, "{own}").map_err(io_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            pid: own,
        })
    }
}

impl Drop for RoleLock {
    fn drop(&mut self) {
        if read_owner(&self.path) != Some(self.pid) {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock {}: {e}", self.path.display());
        }
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Pid recorded in the lock file at `path`, if any.
pub fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// True when `pid` is running and has the same executable name as this
/// process, so a recycled pid does not keep a lock alive.
pub fn is_live_worker(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = sys.process(pid) else {
        return false;
    };
    let own_name = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().to_lowercase()));
    match own_name {
        Some(name) => process.name().to_string_lossy().to_lowercase() == name,
        None => true,
    }
}
