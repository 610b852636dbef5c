use std::path::PathBuf;
use thiserror::Error;
use crate::lock::LockRole;

/// Environment problems that stop a batch from starting.
///
/// Per-job failures never surface here; they end up in the failure folder.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("conversion tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("insufficient disk space on {}: {available} bytes free, {required} required", .path.display())]
    InsufficientDiskSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("{role} lock is held by running process {pid}")]
    InstanceLocked { role: LockRole, pid: u32 },

    #[error("cannot run as {role}: a {other} instance is active")]
    RoleConflict { role: LockRole, other: LockRole },
}
