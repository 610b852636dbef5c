use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::folders::{self, FolderLayout, FolderState};
use crate::result::JobResult;

/// Progress of one worker session, persisted after every result so it
/// survives a crash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub folders: FolderLayout,
    pub total_files: usize,
    pub processed_files: Vec<String>,
    pub failed_files: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(folders: FolderLayout, total_files: usize) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            folders,
            total_files,
            processed_files: Vec::new(),
            failed_files: Vec::new(),
            last_update: None,
        }
    }

    /// Record a finished job; repeated names are counted once
    pub fn record(&mut self, result: &JobResult) {
        let list = if result.success {
            &mut self.processed_files
        } else {
            &mut self.failed_files
        };
        if !list.iter().any(|n| n == &result.file_name) {
            list.push(result.file_name.clone());
        }
        // Work can arrive after the session started
        self.total_files = self.total_files.max(self.finished());
    }

    /// Grow the expected total when more files show up mid-session
    pub fn add_expected(&mut self, files: usize) {
        self.total_files += files;
    }

    pub fn finished(&self) -> usize {
        self.processed_files.len() + self.failed_files.len()
    }

    /// (processed, failed, total)
    pub fn progress(&self) -> (usize, usize, usize) {
        (self.processed_files.len(), self.failed_files.len(), self.total_files)
    }

    /// Seconds since the session started
    pub fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn eta(&self) -> String {
        estimate_remaining_time(self.finished(), self.total_files, self.elapsed_secs())
    }

    /// Write the state as pretty JSON, replacing the previous file atomically
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_update = Some(Utc::now());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create session directory: {}", parent.display()))?;
            }
        }

        let body = serde_json::to_string_pretty(self).context("Failed to serialize session state")?;
        let tmp = tmp_path(path);
        fs::write(&tmp, body)
            .with_context(|| format!("Failed to write session file: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace session file: {}", path.display()))?;
        debug!("Saved session {} to {}", self.session_id, path.display());
        Ok(())
    }

    /// Load a saved session. A missing file is `None`; an unreadable one is
    /// logged and treated the same.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read session file: {}", path.display()));
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Ignoring corrupt session file {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove session file: {}", path.display())),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// File count and size of one queue folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FolderStats {
    pub exists: bool,
    pub count: usize,
    pub total_bytes: u64,
}

impl FolderStats {
    pub fn size_display(&self) -> String {
        format_size(self.total_bytes, DECIMAL)
    }
}

/// Stats for files in `dir` with a supported extension
pub fn folder_stats(dir: &Path, extensions: &[String]) -> FolderStats {
    if !dir.is_dir() {
        return FolderStats { exists: false, count: 0, total_bytes: 0 };
    }
    let mut stats = FolderStats { exists: true, count: 0, total_bytes: 0 };
    let Ok(entries) = fs::read_dir(dir) else {
        return stats;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if folders::is_hidden(&path) || !folders::has_supported_extension(&path, extensions) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                stats.count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }
    stats
}

/// Stats for every folder of the layout
pub fn layout_stats(layout: &FolderLayout, extensions: &[String]) -> Vec<(FolderState, FolderStats)> {
    FolderState::ALL
        .iter()
        .map(|state| (*state, folder_stats(layout.dir(*state), extensions)))
        .collect()
}

/// Seconds as "42.0s", "3.5m" or "2.1h"
pub fn format_time(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

/// Remaining time at the average pace so far
pub fn estimate_remaining_time(processed: usize, total: usize, elapsed_secs: f64) -> String {
    if processed == 0 {
        return "Calculating...".to_string();
    }
    let per_file = elapsed_secs / processed as f64;
    let remaining = total.saturating_sub(processed) as f64;
    format_time(per_file * remaining)
}
