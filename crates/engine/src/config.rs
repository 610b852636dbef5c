use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::converter::ConversionOptions;
use crate::folders::FolderLayout;

/// Lower bound on the worker pool size
pub const MIN_WORKERS: usize = 1;
/// Upper bound on the worker pool size (leave a few cores for the system)
pub const MAX_WORKERS: usize = 22;

/// External conversion tool invocation template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Program to execute
    pub program: PathBuf,
    /// Argument templates; `{input}`, `{output}`, `{language}` and `{dpi}` are substituted
    pub args: Vec<String>,
    /// Arguments appended when deskew is enabled
    pub deskew_args: Vec<String>,
    /// Arguments appended when background removal is enabled
    pub remove_background_args: Vec<String>,
    /// Arguments placed after the option flags, typically the input path
    pub trailing_args: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ocrmypdf"),
            args: vec![
                "-l".to_string(),
                "{language}".to_string(),
                "--image-dpi".to_string(),
                "{dpi}".to_string(),
            ],
            deskew_args: vec!["--deskew".to_string()],
            remove_background_args: vec!["--remove-background".to_string()],
            trailing_args: vec!["{input}".to_string(), "{output}".to_string()],
        }
    }
}

/// Configuration for the batch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory layout backing the queue
    pub folders: FolderLayout,
    /// Directory holding the per-role lock files
    pub lock_dir: PathBuf,
    /// Persisted settings file carrying the `auto_start` preference
    pub settings_file: Option<PathBuf>,
    /// Session progress file written by the worker binary
    pub session_file: PathBuf,
    /// External conversion tool
    pub tool: ToolConfig,
    /// Options handed to the conversion tool
    pub options: ConversionOptions,
    /// File extensions accepted from the incoming folder (lowercase, no dot)
    pub supported_extensions: Vec<String>,
    /// Number of concurrent workers
    pub num_workers: usize,
    /// Attempts per job before it is routed to the failure folder
    pub max_retries: u32,
    /// Hard wall-clock limit for a single conversion attempt
    pub job_timeout_secs: u64,
    /// Pause between attempts of the same job
    pub retry_backoff_ms: u64,
    /// Incoming files younger than this are left alone (still being written)
    pub min_age_secs: u64,
    /// How many times a file abandoned in the in-flight folder is re-attempted
    pub max_recoveries: u32,
    /// Maximum characters of tool output kept per attempt
    pub diagnostic_limit: usize,
    /// Grace period before the cleanup pipeline deletes a working copy
    pub cleanup_grace_ms: u64,
    /// Delete attempts per working copy
    pub cleanup_retries: u32,
    /// Capacity of the cleanup queue
    pub cleanup_queue_capacity: usize,
    /// Minimum free bytes on the output volume to start a batch (e.g., 1GB)
    pub min_free_bytes: u64,
    /// Minimum free bytes on the failure volume before looking elsewhere
    pub failure_min_free_bytes: u64,
    /// Directory name used for a fallback failure folder on another volume
    pub fallback_failure_dir: String,
    /// Interval between lock record refreshes during a batch
    pub lock_refresh_secs: u64,
    /// Pause between batches while the queue is empty
    pub poll_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            folders: FolderLayout::under(Path::new("/srv/ocr")),
            lock_dir: PathBuf::from("/tmp/ocrbatch-locks"),
            settings_file: None,
            session_file: PathBuf::from("/tmp/ocrbatch-session.json"),
            tool: ToolConfig::default(),
            options: ConversionOptions::default(),
            supported_extensions: vec!["pdf".to_string()],
            num_workers: 10,
            max_retries: 2,
            job_timeout_secs: 600, // 10 minutes
            retry_backoff_ms: 2000,
            min_age_secs: 5,
            max_recoveries: 3,
            diagnostic_limit: 2000,
            cleanup_grace_ms: 500,
            cleanup_retries: 5,
            cleanup_queue_capacity: 1024,
            min_free_bytes: 1024 * 1024 * 1024, // 1GB
            failure_min_free_bytes: 100 * 1024 * 1024, // 100MB
            fallback_failure_dir: "OCR_Failed_Fallback".to_string(),
            lock_refresh_secs: 30,
            poll_interval_secs: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.num_workers = clamp_workers(config.num_workers);
        Ok(config)
    }

    /// Worker count suggested for this machine: CPU count minus 4, clamped
    pub fn recommended_workers() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        clamp_workers(cpus.saturating_sub(4))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lock_refresh_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Clamp a requested worker count into the supported range
pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(MIN_WORKERS, MAX_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load_config(Some(Path::new("/nonexistent/ocrbatch.toml"))).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.job_timeout_secs, 600);
        assert_eq!(config.supported_extensions, vec!["pdf".to_string()]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocrbatch.toml");
        std::fs::write(
            &path,
            "num_workers = 4\nmax_retries = 5\n\n[options]\nlanguage = \"eng+kan\"\n",
        )
        .unwrap();

        let config = EngineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.options.language, "eng+kan");
        assert_eq!(config.options.dpi, 300);
        assert_eq!(config.min_age_secs, 5);
    }

    #[test]
    fn test_json_config_and_worker_clamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocrbatch.json");
        std::fs::write(&path, r#"{"num_workers": 100, "lock_dir": "/var/lock/ocr"}"#).unwrap();

        let config = EngineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(config.num_workers, MAX_WORKERS);
        assert_eq!(config.lock_dir, PathBuf::from("/var/lock/ocr"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "num_workers = [").unwrap();
        assert!(EngineConfig::load_config(Some(&path)).is_err());
    }

    proptest! {
        #[test]
        fn test_clamp_workers_in_range(requested in 0usize..1000) {
            let workers = clamp_workers(requested);
            prop_assert!((MIN_WORKERS..=MAX_WORKERS).contains(&workers));
            if (MIN_WORKERS..=MAX_WORKERS).contains(&requested) {
                prop_assert_eq!(workers, requested);
            }
        }
    }
}
