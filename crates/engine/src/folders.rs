use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

/// Windows `ERROR_SHARING_VIOLATION`
const ERROR_SHARING_VIOLATION: i32 = 32;
/// Windows `ERROR_LOCK_VIOLATION`
const ERROR_LOCK_VIOLATION: i32 = 33;

/// Which folder a job's file currently lives in. The folder is the job's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderState {
    Incoming,
    InFlight,
    Done,
    Failed,
    Duplicate,
}

impl FolderState {
    pub const ALL: [FolderState; 5] = [
        FolderState::Incoming,
        FolderState::InFlight,
        FolderState::Done,
        FolderState::Failed,
        FolderState::Duplicate,
    ];

    /// Terminal states end a job's life
    pub fn is_terminal(&self) -> bool {
        matches!(self, FolderState::Done | FolderState::Failed | FolderState::Duplicate)
    }
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FolderState::Incoming => "Incoming",
            FolderState::InFlight => "InFlight",
            FolderState::Done => "Done",
            FolderState::Failed => "Failed",
            FolderState::Duplicate => "Duplicate",
        };
        f.write_str(name)
    }
}

/// Why a move between folders did not happen
#[derive(Debug, Error)]
pub enum MoveError {
    /// The source is gone; another actor moved or deleted it first
    #[error("source vanished: {0}")]
    Vanished(PathBuf),
    /// The source is held open by another process
    #[error("file is in use by another process: {0}")]
    Busy(PathBuf),
    #[error("failed to move {from} -> {to}: {source}")]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The five directories backing the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderLayout {
    pub incoming: PathBuf,
    pub in_flight: PathBuf,
    pub done: PathBuf,
    pub failed: PathBuf,
    pub duplicate: PathBuf,
}

impl Default for FolderLayout {
    fn default() -> Self {
        Self::under(Path::new("/srv/ocr"))
    }
}

impl FolderLayout {
    /// Conventional layout with all five folders under one root
    pub fn under(root: &Path) -> Self {
        Self {
            incoming: root.join("Input"),
            in_flight: root.join("Processing"),
            done: root.join("Output"),
            failed: root.join("Failed"),
            duplicate: root.join("Duplicate"),
        }
    }

    pub fn dir(&self, state: FolderState) -> &Path {
        match state {
            FolderState::Incoming => &self.incoming,
            FolderState::InFlight => &self.in_flight,
            FolderState::Done => &self.done,
            FolderState::Failed => &self.failed,
            FolderState::Duplicate => &self.duplicate,
        }
    }

    /// Create any missing folder
    pub fn ensure_all(&self) -> Result<()> {
        for state in FolderState::ALL {
            let dir = self.dir(state);
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {} folder: {}", state, dir.display()))?;
        }
        Ok(())
    }

    /// Legal transitions of the folder state machine
    pub fn is_legal_move(from: FolderState, to: FolderState) -> bool {
        matches!(
            (from, to),
            (FolderState::Incoming, FolderState::InFlight)
                | (FolderState::InFlight, FolderState::Done)
                | (FolderState::InFlight, FolderState::Failed)
                | (FolderState::Incoming, FolderState::Duplicate)
                | (FolderState::Incoming, FolderState::Failed)
        )
    }

    pub fn path_in(&self, state: FolderState, file_name: &str) -> PathBuf {
        self.dir(state).join(file_name)
    }

    /// Where the conversion output for `file_name` lands
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.done.join(file_name)
    }

    /// True when a non-empty output for `file_name` already exists
    pub fn is_resolved(&self, file_name: &str) -> bool {
        is_non_empty_file(&self.output_path(file_name))
    }

    /// Regular, non-hidden files of a folder sorted by name
    pub fn list_files(&self, state: FolderState) -> Result<Vec<PathBuf>> {
        let dir = self.dir(state);
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    // Root missing is a real error; a vanished child is not
                    if e.depth() == 0 {
                        return Err(e).with_context(|| format!("Failed to read {} folder: {}", state, dir.display()));
                    }
                    debug!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || is_hidden(entry.path()) {
                continue;
            }
            files.push(entry.into_path());
        }
        files.sort();
        Ok(files)
    }

    /// Move a file between folders, keeping its name
    pub fn transition(&self, from: FolderState, to: FolderState, file_name: &str) -> Result<PathBuf, MoveError> {
        debug_assert!(Self::is_legal_move(from, to), "illegal move {} -> {}", from, to);
        let src = self.path_in(from, file_name);
        let dst = if to == FolderState::InFlight {
            self.path_in(to, file_name)
        } else {
            unique_destination(self.dir(to), file_name)
        };
        move_file(&src, &dst)?;
        debug!("{}: {} -> {}", file_name, from, to);
        Ok(dst)
    }
}

/// File name component as an owned string
pub fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Case-insensitive extension match against a list like `["pdf"]`
pub fn has_supported_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|s| s.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// `dir/file_name`, or a timestamp-suffixed name if that is already taken
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let stamp = Utc::now().format("%Y%m%d-%H%M%S%3f");
    let mut n = 0u32;
    loop {
        let mut name = if n == 0 {
            format!("{}_{}", stem, stamp)
        } else {
            format!("{}_{}_{}", stem, stamp, n)
        };
        if let Some(ext) = path.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Classify an I/O error from a move
pub fn classify_move_error(from: &Path, to: &Path, err: io::Error) -> MoveError {
    if err.kind() == io::ErrorKind::NotFound && !from.exists() {
        return MoveError::Vanished(from.to_path_buf());
    }
    if is_sharing_violation(&err) {
        return MoveError::Busy(from.to_path_buf());
    }
    MoveError::Io {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: err,
    }
}

/// True for "held open by another process" style failures
pub fn is_sharing_violation(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    cfg!(windows) && matches!(err.raw_os_error(), Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION))
}

/// Atomic rename within one volume
pub fn move_file(from: &Path, to: &Path) -> Result<(), MoveError> {
    fs::rename(from, to).map_err(|e| classify_move_error(from, to, e))
}

/// Rename, falling back to copy + remove when the destination is on another volume
pub fn relocate_file(from: &Path, to: &Path) -> Result<(), MoveError> {
    match move_file(from, to) {
        Err(MoveError::Io { .. }) => {
            debug!("Rename failed, copying {} -> {}", from.display(), to.display());
            fs::copy(from, to).map_err(|e| classify_move_error(from, to, e))?;
            if let Err(e) = fs::remove_file(from) {
                // Do not leave two copies behind
                let _ = fs::remove_file(to);
                return Err(classify_move_error(from, to, e));
            }
            Ok(())
        }
        other => other,
    }
}
