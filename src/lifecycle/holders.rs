//! Mount Holder Detection
//!
//! Finds processes keeping a mount point busy (open files, working
//! directory or root beneath it) and delivers signals to them.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfs::process::{FDTarget, Process};
use std::path::Path;
use tracing::{debug, info, warn};

/// A process holding a mount point open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub pid: i32,
    pub command: String,
}

/// Port for finding and signalling holders
pub trait HolderControl: Send + Sync {
    /// Processes using anything under `target`
    fn holders(&self, target: &Path) -> Vec<Holder>;

    /// Deliver `signal`; true when delivered or the process is already gone
    fn signal(&self, pid: i32, signal: Signal) -> bool;
}

/// Holder control backed by /proc
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcHolders;

impl HolderControl for ProcHolders {
    fn holders(&self, target: &Path) -> Vec<Holder> {
        if !target.is_absolute() {
            warn!("Not an absolute mount point: {}", target.display());
            return Vec::new();
        }

        let all = match procfs::process::all_processes() {
            Ok(all) => all,
            Err(e) => {
                warn!("Failed to enumerate processes: {}", e);
                return Vec::new();
            }
        };

        let own_pid = std::process::id() as i32;
        let mut result = Vec::new();
        for process in all.flatten() {
            let pid = process.pid();
            if pid <= 1 || pid == own_pid {
                continue;
            }
            if uses_path(&process, target) {
                let command = process
                    .stat()
                    .map(|s| s.comm)
                    .unwrap_or_else(|_| format!("<PID {}>", pid));
                debug!("{} (PID {}) holds {}", command, pid, target.display());
                result.push(Holder { pid, command });
            }
        }

        if !result.is_empty() {
            info!("{} process(es) hold {}", result.len(), target.display());
        }
        result
    }

    fn signal(&self, pid: i32, signal: Signal) -> bool {
        if pid <= 1 {
            warn!("Refusing to signal system process {}", pid);
            return false;
        }

        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                debug!("Sent {} to {}", signal, pid);
                true
            }
            // Already gone
            Err(nix::Error::ESRCH) => true,
            Err(e) => {
                warn!("Failed to send {} to {}: {}", signal, pid, e);
                false
            }
        }
    }
}

fn uses_path(process: &Process, target: &Path) -> bool {
    if process.cwd().is_ok_and(|cwd| cwd.starts_with(target)) {
        return true;
    }
    if process.root().is_ok_and(|root| root.starts_with(target)) {
        return true;
    }

    let Ok(fds) = process.fd() else {
        return false;
    };
    fds.flatten().any(|fd| match &fd.target {
        FDTarget::Path(path) => path.starts_with(target),
        _ => false,
    })
}
