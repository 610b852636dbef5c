use std::fs;
use std::path::{Path, PathBuf};
use anyhow::Result;
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use sysinfo::Disks;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::settings;

/// Free space on one mounted volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub mount_point: PathBuf,
    pub available: u64,
}

/// Where failed files should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePlan {
    /// The primary failure folder has room (or its volume is unknown)
    Primary,
    /// Primary volume is short; try these mount points, best first
    Fallbacks(Vec<PathBuf>),
}

/// Free-space checks gating a batch and steering failed files
#[derive(Debug, Clone)]
pub struct DiskGuard {
    min_free_bytes: u64,
    failure_min_free_bytes: u64,
    fallback_dir_name: String,
    settings_file: Option<PathBuf>,
}

impl DiskGuard {
    pub fn new(min_free_bytes: u64, failure_min_free_bytes: u64, fallback_dir_name: &str) -> Self {
        Self {
            min_free_bytes,
            failure_min_free_bytes,
            fallback_dir_name: fallback_dir_name.to_string(),
            settings_file: None,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        let mut guard = Self::new(cfg.min_free_bytes, cfg.failure_min_free_bytes, &cfg.fallback_failure_dir);
        guard.settings_file = cfg.settings_file.clone();
        guard
    }

    /// Settings file whose auto-start preference is cleared on a full disk
    pub fn with_settings_file(mut self, path: PathBuf) -> Self {
        self.settings_file = Some(path);
        self
    }

    /// Refuse to start when the output volume is short on space.
    ///
    /// On refusal the persisted auto-start preference is switched off so a
    /// restart does not loop against the full disk.
    pub fn preflight(&self, output_dir: &Path) -> Result<u64> {
        let Some(available) = free_space(output_dir) else {
            warn!("Could not determine free space for {}, continuing", output_dir.display());
            return Ok(u64::MAX);
        };

        if available < self.min_free_bytes {
            error!(
                "💾 Low disk space on {}: {} free, {} required",
                output_dir.display(),
                format_size(available, DECIMAL),
                format_size(self.min_free_bytes, DECIMAL)
            );
            if let Some(settings_file) = &self.settings_file {
                if let Err(e) = settings::disable_auto_start(settings_file) {
                    warn!("Could not disable auto-start: {:#}", e);
                }
            }
            return Err(EngineError::InsufficientDiskSpace {
                path: output_dir.to_path_buf(),
                available,
                required: self.min_free_bytes,
            }
            .into());
        }

        debug!("Disk preflight ok: {} free on {}", format_size(available, DECIMAL), output_dir.display());
        Ok(available)
    }

    /// Failure folder to use right now: the primary one, or a fallback on a
    /// volume with room when the primary volume is nearly full. Best effort.
    pub fn failure_folder(&self, primary: &Path) -> PathBuf {
        let volumes = list_volumes();
        match plan_failure_folder(primary, &volumes, self.failure_min_free_bytes) {
            FailurePlan::Primary => primary.to_path_buf(),
            FailurePlan::Fallbacks(mounts) => {
                for mount in mounts {
                    let dir = mount.join(&self.fallback_dir_name);
                    match fs::create_dir_all(&dir) {
                        Ok(()) => {
                            warn!("💾 Failure folder volume is low on space, using fallback {}", dir.display());
                            return dir;
                        }
                        Err(e) => debug!("Fallback {} unusable: {}", dir.display(), e),
                    }
                }
                warn!("💾 No volume with room for failed files, using {} anyway", primary.display());
                primary.to_path_buf()
            }
        }
    }
}

/// Mounted volumes with their free space
pub fn list_volumes() -> Vec<VolumeInfo> {
    Disks::new_with_refreshed_list()
        .iter()
        .map(|d| VolumeInfo {
            mount_point: d.mount_point().to_path_buf(),
            available: d.available_space(),
        })
        .collect()
}

/// Volume holding `path`: the one with the longest matching mount point
pub fn volume_for<'a>(path: &Path, volumes: &'a [VolumeInfo]) -> Option<&'a VolumeInfo> {
    let resolved = resolve(path);
    volumes
        .iter()
        .filter(|v| resolved.starts_with(&v.mount_point))
        .max_by_key(|v| v.mount_point.components().count())
}

/// Free bytes on the volume holding `path`
pub fn free_space(path: &Path) -> Option<u64> {
    let volumes = list_volumes();
    volume_for(path, &volumes).map(|v| v.available)
}

/// Decide where failed files go given the current volume table
pub fn plan_failure_folder(primary: &Path, volumes: &[VolumeInfo], min_free: u64) -> FailurePlan {
    let Some(primary_volume) = volume_for(primary, volumes) else {
        return FailurePlan::Primary;
    };
    if primary_volume.available >= min_free {
        return FailurePlan::Primary;
    }

    let mut candidates: Vec<&VolumeInfo> = volumes
        .iter()
        .filter(|v| v.mount_point != primary_volume.mount_point && v.available >= min_free)
        .collect();
    candidates.sort_by(|a, b| b.available.cmp(&a.available));
    candidates.dedup_by(|a, b| a.mount_point == b.mount_point);

    if candidates.is_empty() {
        info!("Primary failure volume is low and no other volume qualifies");
    }
    FailurePlan::Fallbacks(candidates.into_iter().map(|v| v.mount_point.clone()).collect())
}

/// Canonical form of `path`, or of its nearest existing ancestor
fn resolve(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if let Ok(canonical) = current.canonicalize() {
            let rest = path.strip_prefix(current).unwrap_or(Path::new(""));
            return canonical.join(rest);
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn vol(mount: &str, available: u64) -> VolumeInfo {
        VolumeInfo {
            mount_point: PathBuf::from(mount),
            available,
        }
    }

    #[test]
    fn test_volume_for_prefers_longest_mount() {
        let volumes = vec![vol("/", 10), vol("/mnt/data", 20), vol("/mnt", 30)];
        let v = volume_for(Path::new("/mnt/data/ocr/Failed"), &volumes).unwrap();
        assert_eq!(v.mount_point, PathBuf::from("/mnt/data"));
    }

    #[test]
    fn test_primary_with_room_is_kept() {
        let volumes = vec![vol("/", 50 * GB), vol("/mnt/spare", 500 * GB)];
        assert_eq!(plan_failure_folder(Path::new("/srv/Failed"), &volumes, GB), FailurePlan::Primary);
    }

    #[test]
    fn test_low_primary_picks_roomiest_other_volume() {
        let volumes = vec![vol("/", GB / 10), vol("/mnt/a", 5 * GB), vol("/mnt/b", 50 * GB), vol("/mnt/c", 10)];
        assert_eq!(
            plan_failure_folder(Path::new("/srv/Failed"), &volumes, GB),
            FailurePlan::Fallbacks(vec![PathBuf::from("/mnt/b"), PathBuf::from("/mnt/a")])
        );
    }

    #[test]
    fn test_failure_folder_falls_back_to_primary_when_nothing_fits() {
        let dir = tempfile::tempdir().unwrap();
        let guard = DiskGuard::new(0, u64::MAX, "OCR_Failed_Fallback");
        // No volume can have u64::MAX bytes free
        assert_eq!(guard.failure_folder(dir.path()), dir.path().to_path_buf());
    }

    #[test]
    fn test_preflight_refusal_disables_auto_start() {
        let dir = tempfile::tempdir().unwrap();
        if free_space(dir.path()).is_none() {
            // Volume table unavailable in this environment
            return;
        }
        let settings_file = dir.path().join("settings.json");
        fs::write(&settings_file, r#"{"auto_start": true}"#).unwrap();

        let guard = DiskGuard::new(u64::MAX, 0, "fallback").with_settings_file(settings_file.clone());
        let err = guard.preflight(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InsufficientDiskSpace { .. })
        ));
        assert!(!settings::auto_start_enabled(&settings_file));

        let relaxed = DiskGuard::new(0, 0, "fallback");
        assert!(relaxed.preflight(dir.path()).is_ok());
    }

    proptest! {
        #[test]
        fn test_fallbacks_always_have_room(
            primary_free in 0u64..10 * GB,
            others in prop::collection::vec(0u64..10 * GB, 0..6),
            min_free in 1u64..5 * GB,
        ) {
            let mut volumes = vec![vol("/", primary_free)];
            for (i, free) in others.iter().enumerate() {
                volumes.push(vol(&format!("/mnt/v{}", i), *free));
            }

            match plan_failure_folder(Path::new("/srv/ocr/Failed"), &volumes, min_free) {
                FailurePlan::Primary => prop_assert!(primary_free >= min_free),
                FailurePlan::Fallbacks(mounts) => {
                    prop_assert!(primary_free < min_free);
                    let mut last = u64::MAX;
                    for mount in &mounts {
                        prop_assert_ne!(mount, &PathBuf::from("/"));
                        let free = volumes.iter().find(|v| &v.mount_point == mount).unwrap().available;
                        prop_assert!(free >= min_free);
                        prop_assert!(free <= last);
                        last = free;
                    }
                }
            }
        }
    }
}
