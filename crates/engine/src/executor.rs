use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use crate::claim::Claim;
use crate::cleanup::CleanupHandle;
use crate::config::EngineConfig;
use crate::converter::{ConversionOptions, ConversionTool};
use crate::disk::DiskGuard;
use crate::folders::{self, FolderLayout, MoveError};
use crate::process;
use crate::result::JobResult;
use crate::sidecar;

/// How long to wait for output pipes after the child is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry and timeout policy for conversions
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Attempts per job (at least one is always made)
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Duration,
    /// Characters of tool output kept per attempt
    pub diagnostic_limit: usize,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            timeout: cfg.job_timeout(),
            backoff: cfg.retry_backoff(),
            diagnostic_limit: cfg.diagnostic_limit,
        }
    }
}

/// What a single run of the tool amounted to
#[derive(Debug)]
enum AttemptOutcome {
    Produced { exit_code: Option<i32> },
    NoOutput(String),
    TimedOut(String),
}

/// Runs the conversion tool against claimed files
pub struct TaskExecutor {
    layout: FolderLayout,
    tool: Arc<dyn ConversionTool>,
    options: ConversionOptions,
    settings: ExecutorSettings,
    cleanup: Option<CleanupHandle>,
    disk_guard: Option<DiskGuard>,
}

impl TaskExecutor {
    pub fn new(
        layout: FolderLayout,
        tool: Arc<dyn ConversionTool>,
        options: ConversionOptions,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            layout,
            tool,
            options,
            settings,
            cleanup: None,
            disk_guard: None,
        }
    }

    /// Hand working copies to the cleanup pipeline instead of deleting inline
    pub fn with_cleanup(mut self, cleanup: CleanupHandle) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_disk_guard(mut self, guard: DiskGuard) -> Self {
        self.disk_guard = Some(guard);
        self
    }

    /// Convert one claimed file, retrying up to the configured bound.
    ///
    /// Success means a non-empty output file exists afterwards; the tool's exit
    /// code is only logged. On exhaustion the working copy goes to the failure
    /// folder together with a why.txt holding every attempt's diagnostics.
    pub async fn execute(&self, claim: &Claim) -> JobResult {
        let start = Instant::now();
        let name = claim.file_name();
        let input = claim.path();
        let output = self.layout.output_path(name);
        let max_attempts = self.settings.max_retries.max(1);
        let mut diagnostics: Vec<String> = Vec::new();

        if claim.recovered() {
            info!("{}: Resuming work left behind by an earlier run", name);
        }

        for attempt in 1..=max_attempts {
            if !input.exists() {
                warn!("{}: Working copy vanished before attempt {}", name, attempt);
                return JobResult::failed(
                    name,
                    "Working copy vanished",
                    format!("{} disappeared from the in-flight folder", input.display()),
                    start.elapsed(),
                    attempt - 1,
                );
            }

            discard_empty_output(&output);
            info!("{}: 🚀 Starting conversion (attempt {}/{})", name, attempt, max_attempts);

            let diagnostic = match self.run_attempt(input, &output).await {
                Ok(AttemptOutcome::Produced { exit_code }) => {
                    if exit_code != Some(0) {
                        debug!("{}: Tool exited with {:?} but produced output", name, exit_code);
                    }
                    self.dispose_working_copy(input).await;
                    let elapsed = start.elapsed();
                    info!("{}: ✅ Converted in {:.1}s", name, elapsed.as_secs_f64());
                    return JobResult::succeeded(name, elapsed, attempt);
                }
                Ok(AttemptOutcome::NoOutput(diag)) => {
                    discard_empty_output(&output);
                    diag
                }
                Ok(AttemptOutcome::TimedOut(diag)) => {
                    remove_output(&output);
                    diag
                }
                Err(e) => {
                    discard_empty_output(&output);
                    format!("{:#}", e)
                }
            };

            warn!("{}: Attempt {}/{} failed: {}", name, attempt, max_attempts, first_line(&diagnostic));
            diagnostics.push(format!("attempt {}: {}", attempt, diagnostic));

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.backoff).await;
            }
        }

        self.fail(claim, &diagnostics, start, max_attempts)
    }

    async fn run_attempt(&self, input: &Path, output: &Path) -> Result<AttemptOutcome> {
        let mut cmd = self.tool.command(input, output, &self.options);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn conversion tool: {}", self.tool.name()))?;
        let pid = child.id();
        let limit = self.settings.diagnostic_limit;

        let stdout_handle = tokio::spawn(read_tail(child.stdout.take(), limit));
        let stderr_handle = tokio::spawn(read_tail(child.stderr.take(), limit));

        let status = match tokio::time::timeout(self.settings.timeout, child.wait()).await {
            Ok(waited) => Some(waited.context("Failed to wait for conversion process")?),
            Err(_) => {
                warn!(
                    "TIMEOUT after {}s: killing conversion process tree (PID {:?})",
                    self.settings.timeout.as_secs(),
                    pid
                );
                if let Some(pid) = pid {
                    log_tree_kill(pid, tokio::task::spawn_blocking(move || process::kill_tree(pid)).await);
                }
                // Reap the child even if the tree kill missed it
                if let Err(e) = child.kill().await {
                    debug!("Child already gone after tree kill: {}", e);
                }
                None
            }
        };

        let stdout = collect_tail(stdout_handle).await;
        let stderr = collect_tail(stderr_handle).await;
        let combined = [stderr.trim(), stdout.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        let tail = tail_chars(&combined, limit);

        let Some(status) = status else {
            return Ok(AttemptOutcome::TimedOut(format!(
                "timed out after {}s, process tree killed{}",
                self.settings.timeout.as_secs(),
                suffix(tail)
            )));
        };

        if folders::is_non_empty_file(output) {
            return Ok(AttemptOutcome::Produced { exit_code: status.code() });
        }

        Ok(AttemptOutcome::NoOutput(format!(
            "no output produced (exit code {}){}",
            status.code().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
            suffix(if tail.is_empty() { "Output file not created" } else { tail })
        )))
    }

    async fn dispose_working_copy(&self, path: &Path) {
        if let Some(cleanup) = &self.cleanup {
            match cleanup.enqueue(path.to_path_buf()).await {
                Ok(()) => return,
                Err(e) => warn!("Cleanup pipeline unavailable, deleting inline: {:#}", e),
            }
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("Deleted working copy {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete working copy {}: {}", path.display(), e),
        }
    }

    fn failure_dir(&self) -> PathBuf {
        match &self.disk_guard {
            Some(guard) => guard.failure_folder(&self.layout.failed),
            None => self.layout.failed.clone(),
        }
    }

    fn fail(&self, claim: &Claim, diagnostics: &[String], start: Instant, attempts: u32) -> JobResult {
        let name = claim.file_name();
        let report = diagnostics.join("\n\n");
        let dst = folders::unique_destination(&self.failure_dir(), name);

        match folders::relocate_file(claim.path(), &dst) {
            Ok(()) => {
                if let Err(e) = sidecar::write_why_txt(&dst, &report) {
                    warn!("{}: {:#}", name, e);
                }
                error!("{}: ❌ Failed after {} attempt(s), moved to {}", name, attempts, dst.display());
            }
            Err(MoveError::Vanished(_)) => warn!("{}: Working copy vanished before it could be failed", name),
            // Stays in flight; crash recovery picks it up again
            Err(e) => error!("{}: ❌ Failed after {} attempt(s) and could not be moved: {}", name, attempts, e),
        }

        let last = diagnostics
            .last()
            .cloned()
            .unwrap_or_else(|| "no attempt was made".to_string());
        JobResult::failed(name, "Conversion failed", last, start.elapsed(), attempts)
    }
}

fn log_tree_kill(pid: u32, outcome: std::result::Result<usize, tokio::task::JoinError>) {
    match outcome {
        Ok(0) => debug!("Tree kill for PID {} signalled nothing (already exited?)", pid),
        Ok(killed) => debug!("Tree kill for PID {} signalled {} process(es)", pid, killed),
        Err(e) => debug!("Tree kill for PID {} did not complete: {}", pid, e),
    }
}

/// Remove a zero-byte leftover from a previous attempt
fn discard_empty_output(output: &Path) {
    if let Ok(meta) = fs::metadata(output) {
        if meta.is_file() && meta.len() == 0 {
            match fs::remove_file(output) {
                Ok(()) => debug!("Removed empty output {}", output.display()),
                Err(e) => warn!("Could not remove empty output {}: {}", output.display(), e),
            }
        }
    }
}

/// Remove whatever a killed attempt left behind
fn remove_output(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => debug!("Removed partial output {}", output.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial output {}: {}", output.display(), e),
    }
}

/// Read a stream to the end, keeping roughly the last `limit` characters
async fn read_tail<R>(stream: Option<R>, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut kept = String::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.push_str(&String::from_utf8_lossy(&buf[..n]));
                if kept.len() > limit.saturating_mul(4).max(8192) {
                    kept = tail_chars(&kept, limit).to_string();
                }
            }
        }
    }
    tail_chars(&kept, limit).to_string()
}

async fn collect_tail(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            // A surviving helper still holds the pipe open
            abort.abort();
            String::new()
        }
    }
}

/// The last `limit` characters of `text`
pub fn tail_chars(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    let skip = count - limit;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(text.len());
    &text[start..]
}

fn suffix(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!(": {}", text)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimEngine;
    use crate::config::ToolConfig;
    use crate::converter::CommandTemplate;
    use proptest::prelude::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        scratch: PathBuf,
        claims: ClaimEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = FolderLayout::under(&dir.path().join("queue"));
            layout.ensure_all().unwrap();
            let scratch = dir.path().join("scratch");
            fs::create_dir_all(&scratch).unwrap();
            let claims = ClaimEngine::new(layout, vec!["pdf".to_string()], 3);
            Self { _dir: dir, scratch, claims }
        }

        fn layout(&self) -> &FolderLayout {
            self.claims.layout()
        }

        fn claim(&self, name: &str) -> Claim {
            fs::write(self.layout().incoming.join(name), b"%PDF-1.7 scanned").unwrap();
            self.claims.claim_one(Duration::ZERO).unwrap().unwrap()
        }

        /// Stub tool: `sh -c <script> tool <input> <output> <scratch>`
        fn executor(&self, script: &str, max_retries: u32, timeout: Duration) -> TaskExecutor {
            let tool = CommandTemplate::new(ToolConfig {
                program: PathBuf::from("/bin/sh"),
                args: vec![
                    "-c".to_string(),
                    script.to_string(),
                    "tool".to_string(),
                    "{input}".to_string(),
                    "{output}".to_string(),
                    self.scratch.to_string_lossy().into_owned(),
                ],
                deskew_args: vec![],
                remove_background_args: vec![],
                trailing_args: vec![],
            });
            TaskExecutor::new(
                self.layout().clone(),
                Arc::new(tool),
                ConversionOptions::default(),
                ExecutorSettings {
                    max_retries,
                    timeout,
                    backoff: Duration::from_millis(10),
                    diagnostic_limit: 2000,
                },
            )
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_removes_working_copy() {
        let fx = Fixture::new();
        let claim = fx.claim("good.pdf");
        let executor = fx.executor(r#"cp "$1" "$2""#, 2, Duration::from_secs(30));

        let result = executor.execute(&claim).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.attempts, 1);
        assert!(fx.layout().done.join("good.pdf").exists());
        assert!(!claim.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_advisory() {
        let fx = Fixture::new();
        let claim = fx.claim("noisy.pdf");
        let executor = fx.executor(r#"cp "$1" "$2"; echo "warning: fonts" >&2; exit 7"#, 1, Duration::from_secs(30));

        let result = executor.execute(&claim).await;
        assert!(result.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_always_failing_tool_hits_retry_bound() {
        let fx = Fixture::new();
        let claim = fx.claim("bad.pdf");
        let script = r#"echo run >> "$3/count"; n=$(wc -l < "$3/count" | tr -d ' '); echo "boom-$n" >&2; : > "$2"; exit 1"#;
        let executor = fx.executor(script, 3, Duration::from_secs(30));

        let result = executor.execute(&claim).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_deref().unwrap_or("").contains("boom-3"));

        let runs = fs::read_to_string(fx.scratch.join("count")).unwrap();
        assert_eq!(runs.lines().count(), 3);

        let failed = fx.layout().failed.join("bad.pdf");
        assert!(failed.exists());
        let why = sidecar::read_why_txt(&failed).unwrap();
        for n in 1..=3 {
            assert!(why.contains(&format!("boom-{}", n)), "missing attempt {} in {}", n, why);
        }
        assert!(!fx.layout().done.join("bad.pdf").exists(), "zero-byte output must not survive");
        assert!(!claim.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_attempt_can_succeed() {
        let fx = Fixture::new();
        let claim = fx.claim("flaky.pdf");
        let script = r#"if [ -f "$3/seen" ]; then cp "$1" "$2"; else touch "$3/seen"; exit 1; fi"#;
        let executor = fx.executor(script, 2, Duration::from_secs(30));

        let result = executor.execute(&claim).await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_subtree_and_cleans_output() {
        let fx = Fixture::new();
        let claim = fx.claim("hang.pdf");
        let script = r#"echo partial > "$2"; sleep 60 & echo $! > "$3/helper.pid"; wait"#;
        let executor = fx.executor(script, 1, Duration::from_secs(1));

        let started = Instant::now();
        let result = executor.execute(&claim).await;
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("timed out"));
        assert!(!fx.layout().done.join("hang.pdf").exists());
        assert!(fx.layout().failed.join("hang.pdf").exists());

        let helper: u32 = fs::read_to_string(fx.scratch.join("helper.pid")).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while process::is_process_alive(helper) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!process::is_process_alive(helper), "helper process survived the timeout");
    }

    #[tokio::test]
    async fn test_missing_tool_is_a_failed_attempt() {
        let fx = Fixture::new();
        let claim = fx.claim("orphan.pdf");
        let tool = CommandTemplate::new(ToolConfig {
            program: PathBuf::from("/nonexistent/ocr-tool"),
            ..ToolConfig::default()
        });
        let executor = TaskExecutor::new(
            fx.layout().clone(),
            Arc::new(tool),
            ConversionOptions::default(),
            ExecutorSettings {
                max_retries: 2,
                timeout: Duration::from_secs(5),
                backoff: Duration::from_millis(1),
                diagnostic_limit: 500,
            },
        );

        let result = executor.execute(&claim).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.error.unwrap().contains("Failed to spawn"));
        assert!(fx.layout().failed.join("orphan.pdf").exists());
    }

    proptest! {
        #[test]
        fn test_tail_chars_is_bounded_suffix(text in "\\PC{0,300}", limit in 0usize..200) {
            let tail = tail_chars(&text, limit);
            prop_assert!(tail.chars().count() <= limit);
            prop_assert!(text.ends_with(tail));
            if text.chars().count() <= limit {
                prop_assert_eq!(tail, text.as_str());
            }
        }
    }
}
