use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::process::is_process_alive;

/// Shared by both roles; serializes every acquire in the lock directory
const GUARD_FILE_NAME: &str = "instance.guard";

/// Which kind of instance holds the lock. The two roles exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRole {
    /// Operator-driven processing
    Interactive,
    /// Background worker started without an operator
    Unattended,
}

impl LockRole {
    pub fn other(&self) -> LockRole {
        match self {
            LockRole::Interactive => LockRole::Unattended,
            LockRole::Unattended => LockRole::Interactive,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            LockRole::Interactive => "interactive.lock",
            LockRole::Unattended => "unattended.lock",
        }
    }
}

impl fmt::Display for LockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockRole::Interactive => f.write_str("interactive"),
            LockRole::Unattended => f.write_str("unattended"),
        }
    }
}

/// PID-stamped lock file for one role.
///
/// A record is valid only while its PID is alive; a record left by a dead
/// process is stale and gets replaced by the next acquirer.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    role: LockRole,
    lock_dir: PathBuf,
    pid: u32,
}

impl InstanceLock {
    pub fn new(lock_dir: &Path, role: LockRole) -> Self {
        Self::with_pid(lock_dir, role, std::process::id())
    }

    /// Lock acting on behalf of an explicit PID
    pub fn with_pid(lock_dir: &Path, role: LockRole, pid: u32) -> Self {
        Self {
            role,
            lock_dir: lock_dir.to_path_buf(),
            pid,
        }
    }

    pub fn role(&self) -> LockRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> PathBuf {
        self.lock_dir.join(self.role.file_name())
    }

    /// View of the other role's lock
    pub fn counterpart(&self) -> InstanceLock {
        Self::with_pid(&self.lock_dir, self.role.other(), self.pid)
    }

    /// PID recorded in the lock file, if it exists and parses
    pub fn owner_pid(&self) -> Option<u32> {
        read_pid(&self.path())
    }

    /// True when a record exists and its owner is alive
    pub fn is_locked(&self) -> bool {
        self.owner_pid().map(is_process_alive).unwrap_or(false)
    }

    /// True when the record names this instance
    pub fn is_held(&self) -> bool {
        self.owner_pid() == Some(self.pid)
    }

    /// Try to take the lock. Returns false if a live owner (of this role or
    /// the conflicting one) is in the way.
    pub fn acquire(&self) -> Result<bool> {
        fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("Failed to create lock directory: {}", self.lock_dir.display()))?;
        // Held until return; closing the file drops the OS lock
        let _guard = self.lock_guard()?;

        let other = self.counterpart();
        if let Some(other_pid) = other.owner_pid() {
            if other_pid != self.pid && is_process_alive(other_pid) {
                warn!("Cannot acquire {} lock: {} instance is running (PID {})", self.role, other.role, other_pid);
                return Ok(false);
            }
        }

        let path = self.path();

        // Two rounds: the second one runs after a stale record was removed
        for _ in 0..2 {
            match self.create_record(&path) {
                Ok(()) => {
                    info!("🔒 Acquired {} lock (PID {})", self.role, self.pid);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_pid(&path) {
                        Some(owner) if owner == self.pid => {
                            debug!("{} lock already held by this instance", self.role);
                            return Ok(true);
                        }
                        Some(owner) if is_process_alive(owner) => {
                            warn!("Cannot acquire {} lock: held by live PID {}", self.role, owner);
                            return Ok(false);
                        }
                        owner => {
                            info!("🧹 Removing stale {} lock (owner {:?} is gone)", self.role, owner);
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => {
                                    return Err(e).with_context(|| format!("Failed to remove stale lock: {}", path.display()));
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock file: {}", path.display()));
                }
            }
        }

        // Lost the race for the freshly freed record
        Ok(false)
    }

    /// Rewrite our record so its modification time tracks liveness.
    /// The new record replaces the old one by rename, so readers never see
    /// it empty.
    pub fn refresh(&self) -> Result<()> {
        if !self.is_held() {
            anyhow::bail!("Cannot refresh {} lock: not held by PID {}", self.role, self.pid);
        }
        let path = self.path();
        let tmp = self.lock_dir.join(format!("{}.{}.tmp", self.role.file_name(), self.pid));
        fs::write(&tmp, format!("{}\n", self.pid))
            .with_context(|| format!("Failed to write lock refresh: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to refresh lock file: {}", path.display()))?;
        debug!("Refreshed {} lock", self.role);
        Ok(())
    }

    /// Remove the record, but only if it is ours
    pub fn release(&self) -> Result<()> {
        let path = self.path();
        match read_pid(&path) {
            Some(owner) if owner == self.pid => {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("Failed to remove lock file: {}", path.display()));
                    }
                }
                info!("🔓 Released {} lock", self.role);
            }
            Some(owner) => {
                warn!("Not releasing {} lock: owned by PID {}, not {}", self.role, owner, self.pid);
            }
            None => debug!("{} lock not present, nothing to release", self.role),
        }
        Ok(())
    }

    /// Exclusive OS lock on the directory's guard file, blocking until free
    fn lock_guard(&self) -> Result<File> {
        let guard_path = self.lock_dir.join(GUARD_FILE_NAME);
        let guard = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&guard_path)
            .with_context(|| format!("Failed to open lock guard: {}", guard_path.display()))?;
        guard
            .lock_exclusive()
            .with_context(|| format!("Failed to lock guard: {}", guard_path.display()))?;
        Ok(guard)
    }

    fn create_record(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", self.pid)?;
        file.sync_all()
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Far above any real pid_max
    const DEAD_PID: u32 = 4_000_000;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path(), LockRole::Unattended);

        assert!(!lock.is_locked());
        assert!(lock.acquire().unwrap());
        assert!(lock.is_locked());
        assert_eq!(lock.owner_pid(), Some(std::process::id()));

        lock.release().unwrap();
        assert!(!lock.path().exists());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_second_acquirer_fails_while_owner_lives() {
        let dir = tempfile::tempdir().unwrap();
        // The test process is the live holder
        let first = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(first.acquire().unwrap());

        let second = InstanceLock::with_pid(dir.path(), LockRole::Unattended, DEAD_PID - 1);
        assert!(!second.acquire().unwrap());
        assert_eq!(first.owner_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let dead = InstanceLock::with_pid(dir.path(), LockRole::Unattended, DEAD_PID);
        assert!(dead.acquire().unwrap());
        assert!(!dead.is_locked(), "a dead owner must not count as locked");

        let live = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(live.acquire().unwrap());
        assert_eq!(live.owner_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_unreadable_record_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path(), LockRole::Interactive);
        fs::write(lock.path(), "not a pid").unwrap();

        assert!(!lock.is_locked());
        assert!(lock.acquire().unwrap());
        assert!(lock.is_held());
    }

    #[test]
    fn test_release_does_not_remove_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let owner = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(owner.acquire().unwrap());

        let stranger = InstanceLock::with_pid(dir.path(), LockRole::Unattended, DEAD_PID);
        stranger.release().unwrap();
        assert!(owner.path().exists());
        assert!(stranger.refresh().is_err());
    }

    #[test]
    fn test_roles_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let worker = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(worker.acquire().unwrap());

        let app = InstanceLock::with_pid(dir.path(), LockRole::Interactive, DEAD_PID);
        assert!(!app.acquire().unwrap());
        assert!(!app.path().exists());

        worker.release().unwrap();
        assert!(app.acquire().unwrap());
    }

    #[test]
    fn test_racing_acquirers_over_stale_record_have_one_winner() {
        use std::sync::{Arc, Barrier};

        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let seed = InstanceLock::with_pid(dir.path(), LockRole::Unattended, DEAD_PID);
            fs::write(seed.path(), format!("{}\n", DEAD_PID)).unwrap();

            // Both PIDs are alive: this process and init
            let contenders = [std::process::id(), 1];
            let barrier = Arc::new(Barrier::new(contenders.len()));
            let wins: Vec<bool> = std::thread::scope(|scope| {
                let handles: Vec<_> = contenders
                    .iter()
                    .map(|pid| {
                        let barrier = Arc::clone(&barrier);
                        let lock = InstanceLock::with_pid(dir.path(), LockRole::Unattended, *pid);
                        scope.spawn(move || {
                            barrier.wait();
                            lock.acquire().unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(wins.iter().filter(|w| **w).count(), 1, "round {}: {:?}", round, wins);
            let owner = seed.owner_pid().unwrap();
            let winner = contenders[wins.iter().position(|w| *w).unwrap()];
            assert_eq!(owner, winner, "round {}", round);
        }
    }

    #[test]
    fn test_refresh_never_exposes_an_empty_record() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(lock.acquire().unwrap());

        let done = AtomicBool::new(false);
        let misreads = std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let observer = InstanceLock::with_pid(dir.path(), LockRole::Unattended, DEAD_PID);
                let mut misreads = 0;
                while !done.load(Ordering::SeqCst) {
                    if observer.owner_pid() != Some(std::process::id()) {
                        misreads += 1;
                    }
                }
                misreads
            });
            for _ in 0..500 {
                lock.refresh().unwrap();
            }
            done.store(true, Ordering::SeqCst);
            reader.join().unwrap()
        });

        assert_eq!(misreads, 0);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_refresh_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path(), LockRole::Unattended);
        assert!(lock.acquire().unwrap());
        lock.refresh().unwrap();
        assert!(lock.is_held());
        assert_eq!(fs::read_to_string(lock.path()).unwrap().trim(), std::process::id().to_string());
    }
}
