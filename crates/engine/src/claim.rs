use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::Result;
use log::{debug, error, info, warn};
use crate::disk::DiskGuard;
use crate::folders::{self, FolderLayout, FolderState, MoveError};
use crate::sidecar;

/// Membership of the claimed set plus crash-recovery counters.
/// Only reachable through the claim engine's mutex.
#[derive(Debug, Default)]
struct ClaimState {
    claimed: HashSet<PathBuf>,
    recoveries: HashMap<String, u32>,
}

fn lock_state(state: &Mutex<ClaimState>) -> MutexGuard<'_, ClaimState> {
    // A panic elsewhere must not wedge every worker
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive ownership of one in-flight file. Dropping the claim releases it.
#[derive(Debug)]
pub struct Claim {
    path: PathBuf,
    file_name: String,
    recovered: bool,
    state: Arc<Mutex<ClaimState>>,
}

impl Claim {
    /// Working copy inside the in-flight folder
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// True when the file was abandoned in the in-flight folder by an earlier run
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock_state(&self.state).claimed.remove(&self.path);
        debug!("{}: claim released", self.file_name);
    }
}

/// Assigns each queued file to exactly one worker.
///
/// The whole claim attempt (listing, checks and the move into the in-flight
/// folder) runs under one mutex, so whichever worker enters first sees the
/// authoritative directory contents. Nothing inside waits on other processes:
/// a file held open elsewhere is skipped until the next call.
#[derive(Debug)]
pub struct ClaimEngine {
    layout: FolderLayout,
    extensions: Vec<String>,
    max_recoveries: u32,
    disk_guard: Option<DiskGuard>,
    state: Arc<Mutex<ClaimState>>,
}

impl ClaimEngine {
    pub fn new(layout: FolderLayout, extensions: Vec<String>, max_recoveries: u32) -> Self {
        Self {
            layout,
            extensions,
            max_recoveries,
            disk_guard: None,
            state: Arc::new(Mutex::new(ClaimState::default())),
        }
    }

    /// Route terminal failures through the disk-space guard's folder choice
    pub fn with_disk_guard(mut self, guard: DiskGuard) -> Self {
        self.disk_guard = Some(guard);
        self
    }

    pub fn layout(&self) -> &FolderLayout {
        &self.layout
    }

    /// Number of files currently claimed
    pub fn claimed_count(&self) -> usize {
        lock_state(&self.state).claimed.len()
    }

    /// How often `file_name` has been recovered from the in-flight folder
    pub fn recovery_count(&self, file_name: &str) -> u32 {
        lock_state(&self.state).recoveries.get(file_name).copied().unwrap_or(0)
    }

    /// Claim one file, preferring work abandoned in the in-flight folder.
    /// `None` means nothing is claimable right now.
    pub fn claim_one(&self, min_age: Duration) -> Result<Option<Claim>> {
        let mut state = lock_state(&self.state);

        if let Some(claim) = self.recover_in_flight(&mut state)? {
            return Ok(Some(claim));
        }
        self.claim_incoming(&mut state, min_age)
    }

    fn recover_in_flight(&self, state: &mut ClaimState) -> Result<Option<Claim>> {
        for path in self.layout.list_files(FolderState::InFlight)? {
            let Some(name) = folders::file_name_of(&path) else { continue };
            if state.claimed.contains(&path) {
                continue;
            }

            // Output already produced; only the working copy was left behind
            if self.layout.is_resolved(&name) {
                match fs::remove_file(&path) {
                    Ok(()) => info!("{}: 🗑️  Removed leftover working copy (output exists)", name),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        debug!("{}: Could not remove leftover working copy yet: {}", name, e);
                        continue;
                    }
                }
                state.recoveries.remove(&name);
                continue;
            }

            let count = state.recoveries.get(&name).copied().unwrap_or(0);
            if count >= self.max_recoveries {
                let reason = format!(
                    "Abandoned in the in-flight folder {} time(s); giving up after {} recovery attempt(s)",
                    count + 1,
                    self.max_recoveries
                );
                if self.fail_file(&path, &name, &reason) {
                    state.recoveries.remove(&name);
                }
                continue;
            }

            state.recoveries.insert(name.clone(), count + 1);
            state.claimed.insert(path.clone());
            warn!("{}: 🔄 Recovering abandoned in-flight file (recovery {}/{})", name, count + 1, self.max_recoveries);
            return Ok(Some(self.make_claim(path, name, true)));
        }
        Ok(None)
    }

    fn claim_incoming(&self, state: &mut ClaimState, min_age: Duration) -> Result<Option<Claim>> {
        for path in self.layout.list_files(FolderState::Incoming)? {
            let Some(name) = folders::file_name_of(&path) else { continue };
            let dest = self.layout.path_in(FolderState::InFlight, &name);
            if state.claimed.contains(&dest) {
                continue;
            }

            // Still being written, copied or scanned: leave it alone entirely
            let age = match fs::metadata(&path) {
                Ok(meta) => meta
                    .modified()
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or(Duration::ZERO),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    debug!("{}: Cannot stat, skipping: {}", name, e);
                    continue;
                }
            };
            if age < min_age {
                debug!("{}: Too young ({:?} < {:?}), skipping", name, age, min_age);
                continue;
            }

            if !folders::has_supported_extension(&path, &self.extensions) {
                self.route_unsupported(&path, &name);
                continue;
            }

            if self.layout.output_path(&name).exists() {
                match self.layout.transition(FolderState::Incoming, FolderState::Duplicate, &name) {
                    Ok(dst) => info!("{}: 📑 Output already exists, moved to {}", name, dst.display()),
                    Err(MoveError::Vanished(_)) => {}
                    Err(e) => debug!("{}: Duplicate not moved this cycle: {}", name, e),
                }
                continue;
            }

            if dest.exists() {
                debug!("{}: Same name already in flight, skipping", name);
                continue;
            }

            match folders::move_file(&path, &dest) {
                Ok(()) => {
                    state.claimed.insert(dest.clone());
                    state.recoveries.remove(&name);
                    info!("{}: 📥 Claimed", name);
                    return Ok(Some(self.make_claim(dest, name, false)));
                }
                Err(MoveError::Vanished(_)) => continue,
                Err(MoveError::Busy(_)) => {
                    debug!("{}: In use by another process, skipping this cycle", name);
                    continue;
                }
                Err(e) => {
                    warn!("{}: Claim move failed: {}", name, e);
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn make_claim(&self, path: PathBuf, file_name: String, recovered: bool) -> Claim {
        Claim {
            path,
            file_name,
            recovered,
            state: Arc::clone(&self.state),
        }
    }

    fn failure_dir(&self) -> PathBuf {
        match &self.disk_guard {
            Some(guard) => guard.failure_folder(&self.layout.failed),
            None => self.layout.failed.clone(),
        }
    }

    /// Move a file into the failure folder with a diagnostic. False if it stayed put.
    fn fail_file(&self, path: &Path, name: &str, reason: &str) -> bool {
        let dst = folders::unique_destination(&self.failure_dir(), name);
        match folders::relocate_file(path, &dst) {
            Ok(()) => {
                error!("{}: ❌ {}", name, reason);
                if let Err(e) = sidecar::write_why_txt(&dst, reason) {
                    warn!("{}: {}", name, e);
                }
                true
            }
            Err(MoveError::Vanished(_)) => true,
            Err(e) => {
                warn!("{}: Could not move to failure folder: {}", name, e);
                false
            }
        }
    }

    fn route_unsupported(&self, path: &Path, name: &str) {
        let reason = format!(
            "Unsupported file type (expected one of: {})",
            self.extensions.join(", ")
        );
        let dst = folders::unique_destination(&self.failure_dir(), name);
        match folders::relocate_file(path, &dst) {
            Ok(()) => {
                warn!("{}: ⚠️  {}", name, reason);
                if let Err(e) = sidecar::write_why_txt(&dst, &reason) {
                    warn!("{}: {}", name, e);
                }
            }
            Err(MoveError::Vanished(_)) => {}
            Err(e) => debug!("{}: Unsupported file not moved this cycle: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn setup(max_recoveries: u32) -> (tempfile::TempDir, ClaimEngine) {
        let dir = tempfile::tempdir().unwrap();
        let layout = FolderLayout::under(dir.path());
        layout.ensure_all().unwrap();
        let engine = ClaimEngine::new(layout, vec!["pdf".to_string()], max_recoveries);
        (dir, engine)
    }

    fn drop_in(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"%PDF-1.7").unwrap();
    }

    #[test]
    fn test_claims_in_name_order() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().incoming, "b.pdf");
        drop_in(&engine.layout().incoming, "a.pdf");

        let first = engine.claim_one(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.file_name(), "a.pdf");
        assert!(!first.recovered());
        assert!(first.path().starts_with(&engine.layout().in_flight));
        assert!(!engine.layout().incoming.join("a.pdf").exists());

        let second = engine.claim_one(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.file_name(), "b.pdf");
        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());
        assert_eq!(engine.claimed_count(), 2);
    }

    #[test]
    fn test_young_files_wait_for_min_age() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().incoming, "fresh.pdf");

        assert!(engine.claim_one(Duration::from_millis(400)).unwrap().is_none());
        assert!(engine.layout().incoming.join("fresh.pdf").exists());

        std::thread::sleep(Duration::from_millis(600));
        let claim = engine.claim_one(Duration::from_millis(400)).unwrap().unwrap();
        assert_eq!(claim.file_name(), "fresh.pdf");
    }

    #[test]
    fn test_concurrent_claims_partition_the_queue() {
        let (_dir, engine) = setup(3);
        let total = 60;
        for n in 0..total {
            drop_in(&engine.layout().incoming, &format!("doc_{:03}.pdf", n));
        }

        // Claims leave the threads alive; dropping one early would make its
        // file recoverable by a worker that is still looping
        let per_worker: Vec<Vec<Claim>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut held = Vec::new();
                        while let Some(claim) = engine.claim_one(Duration::ZERO).unwrap() {
                            held.push(claim);
                        }
                        held
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let names: Vec<String> = per_worker
            .iter()
            .flatten()
            .map(|c| c.file_name().to_string())
            .collect();
        let unique: HashSet<_> = names.iter().cloned().collect();
        assert_eq!(names.len(), total, "every file claimed exactly once");
        assert_eq!(unique.len(), total, "no file claimed twice");
        assert_eq!(engine.claimed_count(), total);
        for name in &names {
            assert_eq!(engine.recovery_count(name), 0, "{} went through recovery", name);
        }

        drop(per_worker);
        assert_eq!(engine.claimed_count(), 0);
    }

    #[test]
    fn test_abandoned_in_flight_file_is_recovered_first() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().in_flight, "crashed.pdf");
        drop_in(&engine.layout().incoming, "aaa.pdf");

        let claim = engine.claim_one(Duration::ZERO).unwrap().unwrap();
        assert_eq!(claim.file_name(), "crashed.pdf");
        assert!(claim.recovered());
        assert_eq!(engine.recovery_count("crashed.pdf"), 1);
    }

    #[test]
    fn test_held_claim_is_not_recovered_until_released() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().incoming, "doc.pdf");

        let claim = engine.claim_one(Duration::ZERO).unwrap().unwrap();
        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());

        drop(claim);
        assert_eq!(engine.claimed_count(), 0);
        let again = engine.claim_one(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.file_name(), "doc.pdf");
        assert!(again.recovered());
    }

    #[test]
    fn test_recovery_bound_fails_the_file() {
        let (_dir, engine) = setup(2);
        drop_in(&engine.layout().in_flight, "poison.pdf");

        for round in 1..=2 {
            let claim = engine.claim_one(Duration::ZERO).unwrap().unwrap();
            assert!(claim.recovered());
            assert_eq!(engine.recovery_count("poison.pdf"), round);
        }

        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());
        let failed = engine.layout().failed.join("poison.pdf");
        assert!(failed.exists());
        assert!(sidecar::read_why_txt(&failed).unwrap().contains("giving up"));
        assert_eq!(engine.recovery_count("poison.pdf"), 0);
        assert!(!engine.layout().in_flight.join("poison.pdf").exists());
    }

    #[test]
    fn test_resolved_leftover_is_deleted() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().in_flight, "done.pdf");
        drop_in(&engine.layout().done, "done.pdf");

        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());
        assert!(!engine.layout().in_flight.join("done.pdf").exists());
        assert!(engine.layout().done.join("done.pdf").exists());
    }

    #[test]
    fn test_existing_output_routes_to_duplicate() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().done, "twice.pdf");
        drop_in(&engine.layout().incoming, "twice.pdf");

        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());
        assert!(engine.layout().duplicate.join("twice.pdf").exists());
        assert!(!engine.layout().incoming.join("twice.pdf").exists());
    }

    #[test]
    fn test_unsupported_type_routes_to_failed() {
        let (_dir, engine) = setup(3);
        drop_in(&engine.layout().incoming, "notes.txt");

        assert!(engine.claim_one(Duration::ZERO).unwrap().is_none());
        let failed = engine.layout().failed.join("notes.txt");
        assert!(failed.exists());
        assert!(sidecar::read_why_txt(&failed).unwrap().contains("Unsupported file type"));
    }
}
