//! Single-instance lock backed by a PID marker file.
//!
//! The marker is published with a hard link from a private temp file, so two
//! starters racing on a free lock cannot both win. A marker naming a process
//! that is no longer alive is stale and gets reclaimed: the reclaimer first
//! renames it to a name of its own, so only one starter can take a given
//! stale marker, and a fresh marker taken by mistake is put back.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, Signal, System};
use tracing::{debug, info, instrument, warn};

/// Answers whether a process id is currently running.
pub trait LivenessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness via the OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

/// Ask `pid` to shut down gracefully (SIGINT where supported).
pub fn request_shutdown(pid: u32) -> Result<()> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return Err(anyhow!("process {pid} is not running"));
    }
    let process = system
        .process(pid)
        .ok_or_else(|| anyhow!("process {pid} is not running"))?;
    match process.kill_with(Signal::Interrupt) {
        Some(true) => Ok(()),
        Some(false) => Err(anyhow!("failed to signal process {pid}")),
        None => {
            // Platforms without SIGINT fall back to a hard kill.
            if process.kill() {
                Ok(())
            } else {
                Err(anyhow!("failed to terminate process {pid}"))
            }
        }
    }
}

/// Returned (inside `anyhow::Error`) when another live process holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyRunningError {
    pub pid: u32,
}

impl fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heartbeat already running (pid {})", self.pid)
    }
}

impl std::error::Error for AlreadyRunningError {}

/// What the marker file says about the current holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub running: bool,
    /// Holder pid, present only while that process is alive.
    pub owner: Option<u32>,
    /// Pid recorded in a marker whose process has exited.
    pub stale_owner: Option<u32>,
}

#[derive(Clone)]
pub struct InstanceLock {
    path: PathBuf,
    owner: u32,
    probe: Arc<dyn LivenessProbe + Send + Sync>,
    /// Set while a guard from this lock is live. A marker naming `owner` is
    /// only current while this is set.
    held: Arc<AtomicBool>,
}

impl fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLock")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("held", &self.held.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl InstanceLock {
    /// Lock at `path` owned by the current process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_owner(path, std::process::id(), Arc::new(SystemProbe))
    }

    pub fn with_owner(
        path: impl Into<PathBuf>,
        owner: u32,
        probe: Arc<dyn LivenessProbe + Send + Sync>,
    ) -> Self {
        Self {
            path: path.into(),
            owner,
            probe,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Take the lock, reclaiming a stale marker if needed.
    ///
    /// Fails with [`AlreadyRunningError`] when a live process holds it.
    #[instrument(skip_all, fields(path = %self.path.display(), owner = self.owner))]
    pub fn acquire(&self) -> Result<LockGuard> {
        // One retry covers a stale marker removed between our publish attempts.
        for _ in 0..2 {
            if self.try_publish()? {
                info!("lock acquired");
                self.held.store(true, Ordering::SeqCst);
                return Ok(LockGuard {
                    path: self.path.clone(),
                    owner: self.owner,
                    held: Arc::clone(&self.held),
                    released: false,
                });
            }
            let marker = read_marker(&self.path)?;
            match &marker {
                Marker::Missing => continue,
                Marker::Pid(pid) if self.holder_alive(*pid) => {
                    return Err(AlreadyRunningError { pid: *pid }.into());
                }
                Marker::Pid(pid) => warn!(stale_pid = *pid, "reclaiming stale lock marker"),
                Marker::Unreadable(contents) => {
                    warn!(contents = %contents, "reclaiming unparsable lock marker");
                }
            }
            self.reclaim(&marker)?;
        }
        Err(anyhow!(
            "could not acquire lock {} after reclaiming a stale marker",
            self.path.display()
        ))
    }

    /// Inspect the marker without taking the lock.
    pub fn status(&self) -> Result<LockStatus> {
        let status = match read_marker(&self.path)? {
            Marker::Pid(pid) if self.holder_alive(pid) => LockStatus {
                running: true,
                owner: Some(pid),
                stale_owner: None,
            },
            Marker::Pid(pid) => LockStatus {
                running: false,
                owner: None,
                stale_owner: Some(pid),
            },
            Marker::Missing | Marker::Unreadable(_) => LockStatus {
                running: false,
                owner: None,
                stale_owner: None,
            },
        };
        Ok(status)
    }

    /// Our own pid counts as alive only while we hold a guard; otherwise it
    /// is a leftover from an earlier process that had the same pid.
    fn holder_alive(&self, pid: u32) -> bool {
        if pid == self.owner {
            self.held.load(Ordering::SeqCst)
        } else {
            self.probe.is_alive(pid)
        }
    }

    /// Take the stale marker `expected` out of the way.
    ///
    /// The marker is renamed to a path private to this owner, so a competing
    /// reclaimer cannot remove a marker published after our read. If what we
    /// moved is no longer `expected`, someone else published in between: it
    /// is restored and reported as running.
    fn reclaim(&self, expected: &Marker) -> Result<()> {
        let claimed = self.claim_path();
        remove_if_present(&claimed)?;
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            // Another starter reclaimed it first; the next publish decides.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("claim lock {}", self.path.display()));
            }
        }

        let found = read_marker(&claimed)?;
        if &found == expected {
            return remove_if_present(&claimed);
        }

        let restored = fs::hard_link(&claimed, &self.path);
        remove_if_present(&claimed)?;
        if let Err(err) = restored {
            warn!(err = %err, marker = ?found, "could not restore lock marker taken during reclaim");
        }
        match found {
            Marker::Pid(pid) => Err(AlreadyRunningError { pid }.into()),
            Marker::Missing | Marker::Unreadable(_) => Ok(()),
        }
    }

    fn claim_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".stale.{}", self.owner));
        self.path.with_file_name(name)
    }

    /// Write our pid to a private temp file and hard-link it into place.
    /// Returns `false` when a marker already exists.
    fn try_publish(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension(format!("{}.tmp", self.owner));
        fs::write(&tmp, format!("{}\n", self.owner))
            .with_context(|| format!("write {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, &self.path);
        let cleanup = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                if let Err(err) = cleanup {
                    debug!(tmp = %tmp.display(), err = %err, "failed to remove lock temp file");
                }
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("publish lock {}", self.path.display())),
        }
    }
}

/// Held lock; removes the marker on release or drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: u32,
    held: Arc<AtomicBool>,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.held.store(false, Ordering::SeqCst);
        // Only remove a marker that still names us.
        match read_marker(&self.path)? {
            Marker::Pid(pid) if pid == self.owner => {
                remove_if_present(&self.path)?;
                info!(path = %self.path.display(), "lock released");
            }
            other => {
                warn!(path = %self.path.display(), marker = ?other, "lock marker no longer ours, leaving it");
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(path = %self.path.display(), err = ?err, "failed to release lock");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Missing,
    Pid(u32),
    Unreadable(String),
}

fn read_marker(path: &Path) -> Result<Marker> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .trim()
            .parse::<u32>()
            .map(Marker::Pid)
            .unwrap_or(Marker::Unreadable(contents))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Marker::Missing),
        Err(err) => Err(err).with_context(|| format!("read lock marker {}", path.display())),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProbe;

    fn lock(path: &Path, owner: u32, probe: &ScriptedProbe) -> InstanceLock {
        InstanceLock::with_owner(path, owner, Arc::new(probe.clone()))
    }

    #[test]
    fn acquire_writes_pid_and_release_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let probe = ScriptedProbe::default();

        let guard = lock(&path, 100, &probe).acquire().expect("acquire");
        assert_eq!(fs::read_to_string(&path).expect("marker"), "100\n");
        assert!(!temp.path().join("heartbeat.100.tmp").exists());

        guard.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_holder_alive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let probe = ScriptedProbe::alive([100]);

        let _first = lock(&path, 100, &probe).acquire().expect("first");
        let err = lock(&path, 200, &probe).acquire().unwrap_err();

        let running = err
            .downcast_ref::<AlreadyRunningError>()
            .expect("already running");
        assert_eq!(running.pid, 100);
        assert_eq!(fs::read_to_string(&path).expect("marker"), "100\n");
    }

    #[test]
    fn stale_marker_is_reclaimed_once_holder_dies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let probe = ScriptedProbe::alive([100]);

        let first = lock(&path, 100, &probe).acquire().expect("first");
        std::mem::forget(first);
        probe.kill(100);

        let second = lock(&path, 200, &probe).acquire().expect("reclaim");
        assert_eq!(fs::read_to_string(&path).expect("marker"), "200\n");
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn garbage_marker_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        fs::write(&path, "not a pid").expect("write");

        let _guard = lock(&path, 7, &ScriptedProbe::default())
            .acquire()
            .expect("acquire");
        assert_eq!(fs::read_to_string(&path).expect("marker"), "7\n");
    }

    #[test]
    fn drop_leaves_a_marker_that_is_not_ours() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let guard = lock(&path, 1, &ScriptedProbe::default())
            .acquire()
            .expect("acquire");
        fs::write(&path, "2\n").expect("overwrite");

        drop(guard);
        assert_eq!(fs::read_to_string(&path).expect("marker"), "2\n");
    }

    #[test]
    fn status_reports_live_and_stale_holders() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let probe = ScriptedProbe::alive([100]);
        let observer = lock(&path, 999, &probe);

        let idle = observer.status().expect("status");
        assert!(!idle.running);
        assert_eq!(idle.owner, None);

        let guard = lock(&path, 100, &probe).acquire().expect("acquire");
        let running = observer.status().expect("status");
        assert!(running.running);
        assert_eq!(running.owner, Some(100));

        std::mem::forget(guard);
        probe.kill(100);
        let stale = observer.status().expect("status");
        assert!(!stale.running);
        assert_eq!(stale.stale_owner, Some(100));
    }

    /// Liveness check that lets a competing starter reclaim the marker
    /// before answering that the stale holder is dead.
    struct RacingLiveness {
        path: PathBuf,
        rival: u32,
        rival_guard: std::sync::Mutex<Option<LockGuard>>,
    }

    impl LivenessProbe for RacingLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            let rival = lock(&self.path, self.rival, &ScriptedProbe::alive([self.rival]));
            let guard = rival.acquire().expect("rival reclaims first");
            *self.rival_guard.lock().expect("rival guard") = Some(guard);
            pid == self.rival
        }
    }

    #[test]
    fn losing_a_stale_reclaim_race_reports_the_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        fs::write(&path, "1\n").expect("stale marker");
        let probe = Arc::new(RacingLiveness {
            path: path.clone(),
            rival: 100,
            rival_guard: std::sync::Mutex::new(None),
        });

        let err = InstanceLock::with_owner(&path, 200, probe.clone())
            .acquire()
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<AlreadyRunningError>(),
            Some(&AlreadyRunningError { pid: 100 })
        );
        assert_eq!(fs::read_to_string(&path).expect("marker"), "100\n");
        assert!(probe.rival_guard.lock().expect("rival guard").is_some());
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("heartbeat.pid")]);
    }

    #[test]
    fn own_pid_marker_is_live_only_while_guard_is_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.pid");
        let probe = ScriptedProbe::alive([42]);
        let ours = lock(&path, 42, &probe);

        // Leftover from an earlier process that had our pid.
        fs::write(&path, "42\n").expect("leftover marker");
        let leftover = ours.status().expect("status");
        assert!(!leftover.running);
        assert_eq!(leftover.stale_owner, Some(42));

        let guard = ours.acquire().expect("reclaim own leftover");
        let held = ours.status().expect("status");
        assert!(held.running);
        assert_eq!(held.owner, Some(42));
        let err = ours.acquire().unwrap_err();
        assert_eq!(
            err.downcast_ref::<AlreadyRunningError>(),
            Some(&AlreadyRunningError { pid: 42 })
        );

        guard.release().expect("release");
        assert!(!ours.status().expect("status").running);
    }

    #[test]
    fn system_probe_sees_current_process() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }
}
