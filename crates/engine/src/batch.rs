use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use crate::claim::ClaimEngine;
use crate::cleanup::CleanupPipeline;
use crate::config::{clamp_workers, EngineConfig};
use crate::converter::ConversionTool;
use crate::disk::DiskGuard;
use crate::error::EngineError;
use crate::executor::{ExecutorSettings, TaskExecutor};
use crate::folders::FolderLayout;
use crate::lock::{InstanceLock, LockRole};
use crate::result::{JobResult, RecentResults};

/// Where a batch currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Running,
    /// Stop requested; in-flight jobs are finishing
    Draining,
    Complete,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Idle => write!(f, "idle"),
            BatchPhase::Running => write!(f, "running"),
            BatchPhase::Draining => write!(f, "draining"),
            BatchPhase::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative stop request shared between the caller and a running batch
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts returned by one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub phase: BatchPhase,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

enum UnitOutcome {
    Finished(JobResult),
    NoWork,
}

/// Runs batches over the folder queue with a fixed-size worker pool
pub struct BatchEngine {
    config: EngineConfig,
    claims: Arc<ClaimEngine>,
    tool: Arc<dyn ConversionTool>,
    lock: InstanceLock,
    disk_guard: DiskGuard,
    num_workers: usize,
    phase: Mutex<BatchPhase>,
    recent: Mutex<RecentResults>,
}

impl BatchEngine {
    pub fn new(config: EngineConfig, tool: Arc<dyn ConversionTool>, role: LockRole) -> Self {
        let disk_guard = DiskGuard::from_config(&config);
        let claims = ClaimEngine::new(
            config.folders.clone(),
            config.supported_extensions.clone(),
            config.max_recoveries,
        )
        .with_disk_guard(disk_guard.clone());

        Self {
            lock: InstanceLock::new(&config.lock_dir, role),
            num_workers: clamp_workers(config.num_workers),
            claims: Arc::new(claims),
            tool,
            disk_guard,
            config,
            phase: Mutex::new(BatchPhase::Idle),
            recent: Mutex::new(RecentResults::default()),
        }
    }

    /// Override the pool size (clamped to the supported range)
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = clamp_workers(num_workers);
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn layout(&self) -> &FolderLayout {
        &self.config.folders
    }

    pub fn lock(&self) -> &InstanceLock {
        &self.lock
    }

    pub fn phase(&self) -> BatchPhase {
        *lock_or_recover(&self.phase)
    }

    /// The latest `n` results, oldest first
    pub fn recent_results(&self, n: usize) -> Vec<JobResult> {
        lock_or_recover(&self.recent).tail(n)
    }

    fn set_phase(&self, phase: BatchPhase) {
        let mut current = lock_or_recover(&self.phase);
        if *current != phase {
            debug!("Batch phase {} -> {}", *current, phase);
            *current = phase;
        }
    }

    /// Process the queue until it is empty or a stop is requested.
    ///
    /// `on_result` is called once per executed job, in completion order. A
    /// failing entry gate (folders, tool, disk space, instance lock) returns
    /// an error before any file is touched.
    pub async fn process_batch<F>(&self, mut on_result: F, stop: &StopSignal) -> Result<BatchSummary>
    where
        F: FnMut(&JobResult),
    {
        if stop.is_requested() {
            return Ok(BatchSummary { succeeded: 0, failed: 0, phase: BatchPhase::Idle });
        }

        let layout = self.layout();
        layout.ensure_all()?;
        self.tool
            .validate()
            .map_err(|e| EngineError::ToolUnavailable(format!("{:#}", e)))?;
        self.disk_guard.preflight(&layout.done)?;
        let acquired_here = self.acquire_lock()?;

        self.set_phase(BatchPhase::Running);
        info!("🔄 Batch started with {} worker(s)", self.num_workers);

        let cleanup = CleanupPipeline::start(
            self.config.cleanup_grace(),
            self.config.cleanup_retries,
            self.config.cleanup_queue_capacity,
        );
        let executor = Arc::new(
            TaskExecutor::new(
                layout.clone(),
                Arc::clone(&self.tool),
                self.config.options.clone(),
                ExecutorSettings::from_config(&self.config),
            )
            .with_cleanup(cleanup.handle())
            .with_disk_guard(self.disk_guard.clone()),
        );
        let min_age = self.config.min_age();

        let mut units: JoinSet<Result<UnitOutcome>> = JoinSet::new();
        for _ in 0..self.num_workers {
            units.spawn(run_unit(Arc::clone(&self.claims), Arc::clone(&executor), min_age));
        }

        let mut refresh = tokio::time::interval(self.config.lock_refresh_interval());
        refresh.tick().await;

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut idle = 0usize;
        let mut stopping = false;

        while !units.is_empty() {
            tokio::select! {
                joined = units.join_next() => {
                    let finished = match joined {
                        Some(Ok(Ok(UnitOutcome::Finished(result)))) => Some(result),
                        Some(Ok(Ok(UnitOutcome::NoWork))) => None,
                        Some(Ok(Err(e))) => {
                            error!("Worker unit failed: {:#}", e);
                            None
                        }
                        Some(Err(e)) => {
                            error!("Worker unit crashed: {}", e);
                            None
                        }
                        None => break,
                    };

                    match finished {
                        Some(result) => {
                            idle = 0;
                            if result.success {
                                succeeded += 1;
                            } else {
                                failed += 1;
                            }
                            on_result(&result);
                            lock_or_recover(&self.recent).push(result);
                            if !stopping {
                                units.spawn(run_unit(Arc::clone(&self.claims), Arc::clone(&executor), min_age));
                            }
                        }
                        None => {
                            idle += 1;
                            if !stopping && idle < self.num_workers {
                                units.spawn(run_unit(Arc::clone(&self.claims), Arc::clone(&executor), min_age));
                            }
                        }
                    }
                }
                _ = stop.stopped(), if !stopping => {
                    stopping = true;
                    self.set_phase(BatchPhase::Draining);
                    info!("⏹️ Stop requested, waiting for {} in-flight job(s)", units.len());
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.lock.refresh() {
                        warn!("⚠️ Lock refresh failed: {:#}", e);
                    }
                }
            }
        }

        self.set_phase(BatchPhase::Draining);
        drop(executor);
        cleanup.shutdown().await;

        if acquired_here {
            if let Err(e) = self.lock.release() {
                warn!("⚠️ Could not release {} lock: {:#}", self.lock.role(), e);
            }
        }

        self.set_phase(BatchPhase::Complete);
        info!("✅ Batch complete: {} succeeded, {} failed", succeeded, failed);
        Ok(BatchSummary { succeeded, failed, phase: BatchPhase::Complete })
    }

    /// Make sure this instance holds its role lock. Returns true when it was
    /// taken by this call.
    fn acquire_lock(&self) -> Result<bool> {
        if self.lock.is_held() {
            return Ok(false);
        }
        if self.lock.acquire()? {
            return Ok(true);
        }

        let other = self.lock.counterpart();
        if other.is_locked() {
            return Err(EngineError::RoleConflict {
                role: self.lock.role(),
                other: other.role(),
            }
            .into());
        }
        Err(EngineError::InstanceLocked {
            role: self.lock.role(),
            pid: self.lock.owner_pid().unwrap_or(0),
        }
        .into())
    }
}

/// One pool slot: claim a file, convert it if there was one
async fn run_unit(claims: Arc<ClaimEngine>, executor: Arc<TaskExecutor>, min_age: Duration) -> Result<UnitOutcome> {
    let claim = tokio::task::spawn_blocking(move || claims.claim_one(min_age))
        .await
        .context("Claim task panicked")??;

    match claim {
        Some(claim) => {
            let result = executor.execute(&claim).await;
            Ok(UnitOutcome::Finished(result))
        }
        None => Ok(UnitOutcome::NoWork),
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
