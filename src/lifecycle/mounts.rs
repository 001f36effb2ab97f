//! Mount Lifecycle Manager
//!
//! Every mount the provisioner creates is a [`MountHandle`] registered here.
//! Release is idempotent and never raises: a graceful unmount is tried
//! first, then holders are signalled with escalating strength, and lazy or
//! forced unmounts come last. A mount that stays busy is reported, not
//! thrown.

use super::holders::HolderControl;
use backoff::backoff::Backoff;
use crate::domain::ports::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::exec::{Ladder, RetryPolicy};
use indexmap::IndexMap;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// umount messages meaning the target is already gone
const NOT_MOUNTED_MARKERS: &[&str] = &["not mounted", "no mount point specified", "mountpoint not found"];

// =============================================================================
// Handle Types
// =============================================================================

/// What kind of mount a handle represents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MountKind {
    /// Bind of a host directory
    Bind,
    /// Kernel pseudo-filesystem (proc, sysfs, devpts, efivarfs)
    Pseudo { fstype: String },
    /// Block-device filesystem
    Filesystem { fstype: Option<String> },
    /// Storage-engine dataset
    Dataset,
}

impl MountKind {
    pub fn pseudo(fstype: &str) -> Self {
        MountKind::Pseudo {
            fstype: fstype.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Unacquired,
    Acquired,
    Releasing,
    Released,
}

/// A mount owned by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountHandle {
    pub id: u64,
    pub source: String,
    pub target: PathBuf,
    pub kind: MountKind,
}

/// Result of a release request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Unmounted by the named strategy
    Unmounted { strategy: String },
    /// Released earlier (or being released right now)
    AlreadyReleased,
    /// Every strategy failed; the mount is still in place
    Busy { reason: String },
}

impl ReleaseOutcome {
    pub fn is_busy(&self) -> bool {
        matches!(self, ReleaseOutcome::Busy { .. })
    }
}

struct Entry {
    handle: MountHandle,
    state: HandleState,
    /// Released with every strategy failing
    busy: bool,
}

// =============================================================================
// Mount Manager
// =============================================================================

pub struct MountManager {
    runner: Arc<dyn CommandRunner>,
    holders: Arc<dyn HolderControl>,
    timeout: Duration,
    /// Wait after the first signal round; doubles for the next
    signal_delay: Duration,
    entries: Mutex<IndexMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl MountManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        holders: Arc<dyn HolderControl>,
        timeout: Duration,
        signal_delay: Duration,
    ) -> Self {
        Self {
            runner,
            holders,
            timeout,
            signal_delay,
            entries: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Mount `source` at `target` and register the handle
    pub async fn acquire(&self, source: &str, target: &Path, kind: MountKind) -> Result<MountHandle> {
        let failed = |reason: String| Error::MountFailed {
            source_path: source.to_string(),
            target: target.display().to_string(),
            reason,
        };

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| failed(format!("cannot create mount point: {}", e)))?;

        let spec = mount_command(source, target, &kind).timeout(self.timeout);
        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !out.success() {
            return Err(failed(out.stderr.trim().to_string()));
        }

        let handle = MountHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            source: source.to_string(),
            target: target.to_path_buf(),
            kind,
        };
        self.entries.lock().insert(
            handle.id,
            Entry {
                handle: handle.clone(),
                state: HandleState::Acquired,
                busy: false,
            },
        );

        info!("Mounted {} at {}", source, target.display());
        Ok(handle)
    }

    /// Release one handle; safe to call any number of times
    pub async fn release(&self, handle: &MountHandle) -> ReleaseOutcome {
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(&handle.id) {
                Some(entry) if entry.state == HandleState::Acquired => {
                    entry.state = HandleState::Releasing;
                }
                _ => {
                    debug!("{} already released", handle.target.display());
                    return ReleaseOutcome::AlreadyReleased;
                }
            }
        }

        let outcome = self.unmount(&handle.target).await;

        if let Some(entry) = self.entries.lock().get_mut(&handle.id) {
            entry.state = HandleState::Released;
            entry.busy = outcome.is_busy();
        }
        outcome
    }

    /// Release every live handle, newest first; returns how many mounts
    /// were left busy over the manager's lifetime
    pub async fn release_all(&self) -> usize {
        let live = self.live();
        for handle in live.iter().rev() {
            self.release(handle).await;
        }

        let busy = self.busy().len();
        if busy > 0 {
            warn!("{} mount(s) could not be released", busy);
        }
        busy
    }

    /// Handles released while still mounted
    pub fn busy(&self) -> Vec<MountHandle> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.busy)
            .map(|e| e.handle.clone())
            .collect()
    }

    pub fn state(&self, handle: &MountHandle) -> HandleState {
        self.entries
            .lock()
            .get(&handle.id)
            .map(|e| e.state)
            .unwrap_or(HandleState::Unacquired)
    }

    /// Handles currently mounted, in acquisition order
    pub fn live(&self) -> Vec<MountHandle> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state == HandleState::Acquired)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Make `root` usable as a chroot: dev, dev/pts, proc, sys and, on
    /// UEFI, efivars
    ///
    /// On failure everything mounted by this call is released again.
    pub async fn bind_chroot(&self, root: &Path, uefi: bool) -> Result<Vec<MountHandle>> {
        let required = [
            ("/dev", "dev", MountKind::Bind),
            ("devpts", "dev/pts", MountKind::pseudo("devpts")),
            ("proc", "proc", MountKind::pseudo("proc")),
            ("sysfs", "sys", MountKind::pseudo("sysfs")),
        ];

        let mut acquired = Vec::new();
        for (source, relative, kind) in required {
            match self.acquire(source, &root.join(relative), kind).await {
                Ok(handle) => acquired.push(handle),
                Err(e) => {
                    for handle in acquired.iter().rev() {
                        self.release(handle).await;
                    }
                    return Err(e);
                }
            }
        }

        if uefi {
            let efivars = root.join("sys/firmware/efi/efivars");
            match self
                .acquire("efivarfs", &efivars, MountKind::pseudo("efivarfs"))
                .await
            {
                Ok(handle) => acquired.push(handle),
                // Boot entries can still be installed as removable media
                Err(e) => warn!("efivars unavailable in chroot: {}", e),
            }
        }

        Ok(acquired)
    }

    // -------------------------------------------------------------------------
    // Release Strategies
    // -------------------------------------------------------------------------

    async fn unmount(&self, target: &Path) -> ReleaseOutcome {
        let mut schedule = RetryPolicy::exponential(2, self.signal_delay, self.signal_delay * 4).schedule();
        let term_wait = schedule.next_backoff().unwrap_or(self.signal_delay);
        let kill_wait = schedule.next_backoff().unwrap_or(self.signal_delay);

        let climbed = Ladder::new(format!("release {}", target.display()))
            .rung("unmount", self.umount(target, &[]))
            .rung(
                "terminate holders",
                self.evict(target, Signal::SIGTERM, term_wait),
            )
            .rung("kill holders", self.evict(target, Signal::SIGKILL, kill_wait))
            .rung("forced unmount", self.umount(target, &["-f"]))
            .rung("lazy unmount", self.umount(target, &["-l"]))
            .climb()
            .await;

        match climbed {
            Ok(climbed) => {
                debug!("Released {} via {}", target.display(), climbed.rung);
                ReleaseOutcome::Unmounted {
                    strategy: climbed.rung,
                }
            }
            Err(exhausted) => {
                warn!(
                    "{} is still busy after every release strategy: {}",
                    target.display(),
                    exhausted.summary()
                );
                ReleaseOutcome::Busy {
                    reason: exhausted.summary(),
                }
            }
        }
    }

    /// Signal every holder of `target`, wait, then unmount
    async fn evict(&self, target: &Path, signal: Signal, wait: Duration) -> Result<()> {
        let holders = self.holders.clone();
        let path = target.to_path_buf();
        let found = tokio::task::spawn_blocking(move || holders.holders(&path))
            .await
            .map_err(|e| Error::Internal(format!("holder scan failed: {}", e)))?;

        if !found.is_empty() {
            for holder in &found {
                info!(
                    "Sending {} to {} (PID {}) holding {}",
                    signal,
                    holder.command,
                    holder.pid,
                    target.display()
                );
                self.holders.signal(holder.pid, signal);
            }
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        self.umount(target, &[]).await
    }

    async fn umount(&self, target: &Path, flags: &[&str]) -> Result<()> {
        let spec = CommandSpec::new("umount")
            .args(flags.iter().copied())
            .arg(target.display().to_string())
            .timeout(self.timeout);
        let out = self.runner.run(&spec).await?;

        if out.success() || out.contains_marker(NOT_MOUNTED_MARKERS) {
            Ok(())
        } else {
            debug!("umount {}: {}", target.display(), out.stderr.trim());
            Err(Error::ResourceBusy {
                target: target.display().to_string(),
            })
        }
    }
}

fn mount_command(source: &str, target: &Path, kind: &MountKind) -> CommandSpec {
    let spec = CommandSpec::new("mount");
    let spec = match kind {
        MountKind::Bind => spec.arg("--bind"),
        MountKind::Pseudo { fstype } => spec.arg("-t").arg(fstype),
        MountKind::Filesystem { fstype: Some(fstype) } => spec.arg("-t").arg(fstype),
        MountKind::Filesystem { fstype: None } => spec,
        MountKind::Dataset => spec.args(["-t", "zfs", "-o", "zfsutil"]),
    };
    spec.arg(source).arg(target.display().to_string())
}
