pub mod config;
pub mod error;
pub mod folders;
pub mod sidecar;
pub mod process;
pub mod lock;
pub mod claim;
pub mod converter;
pub mod executor;
pub mod cleanup;
pub mod batch;
pub mod disk;
pub mod result;
pub mod session;
pub mod settings;

pub use config::EngineConfig;
pub use error::EngineError;
pub use folders::{FolderLayout, FolderState};
pub use lock::{InstanceLock, LockRole};
pub use converter::{CommandTemplate, ConversionOptions, ConversionTool};
pub use batch::{BatchEngine, BatchPhase, BatchSummary, StopSignal};
pub use result::JobResult;
pub use session::SessionState;
