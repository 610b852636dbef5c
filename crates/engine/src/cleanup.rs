use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

enum CleanupMessage {
    Delete(PathBuf),
    Stop,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

impl Pending {
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Totals reported when the pipeline shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub deleted: usize,
    pub abandoned: usize,
}

/// Sender side used by workers to queue a working copy for deletion
#[derive(Clone)]
pub struct CleanupHandle {
    tx: mpsc::Sender<CleanupMessage>,
    pending: Arc<Pending>,
}

impl CleanupHandle {
    /// Queue a file for deletion; waits while the queue is full.
    /// Cancelling the wait leaves nothing queued.
    pub async fn enqueue(&self, path: PathBuf) -> Result<()> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| anyhow!("Cleanup pipeline is closed"))?;
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        permit.send(CleanupMessage::Delete(path));
        Ok(())
    }

    /// Deletions queued or in progress
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }
}

/// Background deletion of processed working copies.
///
/// A single consumer takes paths off a bounded queue one at a time. Each file
/// is removed after a grace period, retrying with a growing wait while
/// something still holds it open. Files that never go away are left in place
/// and logged.
pub struct CleanupPipeline {
    handle: CleanupHandle,
    worker: JoinHandle<CleanupStats>,
}

impl CleanupPipeline {
    pub fn start(grace: Duration, retries: u32, capacity: usize) -> Self {
        Self::start_with(grace, retries, capacity, |path: &Path| fs::remove_file(path))
    }

    fn start_with<R>(grace: Duration, retries: u32, capacity: usize, mut remove: R) -> Self
    where
        R: FnMut(&Path) -> io::Result<()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(Pending::default());
        let handle = CleanupHandle {
            tx,
            pending: Arc::clone(&pending),
        };

        let worker = tokio::spawn(async move {
            let mut stats = CleanupStats::default();
            while let Some(msg) = rx.recv().await {
                match msg {
                    CleanupMessage::Delete(path) => {
                        if delete_with_retries(&path, grace, retries, &mut remove).await {
                            stats.deleted += 1;
                        } else {
                            stats.abandoned += 1;
                        }
                        pending.finish_one();
                    }
                    CleanupMessage::Stop => break,
                }
            }
            stats
        });

        Self { handle, worker }
    }

    pub fn handle(&self) -> CleanupHandle {
        self.handle.clone()
    }

    /// Wait until every queued deletion has finished
    pub async fn drain(&self) {
        loop {
            let notified = self.handle.pending.drained.notified();
            if self.handle.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain the queue, stop the worker and wait for it
    pub async fn shutdown(self) -> CleanupStats {
        self.drain().await;
        let _ = self.handle.tx.send(CleanupMessage::Stop).await;
        match self.worker.await {
            Ok(stats) => {
                if stats.deleted > 0 || stats.abandoned > 0 {
                    info!("🗑️ Cleanup finished: {} deleted, {} left behind", stats.deleted, stats.abandoned);
                }
                stats
            }
            Err(e) => {
                error!("Cleanup worker crashed: {}", e);
                CleanupStats::default()
            }
        }
    }
}

/// Delete `path`, waiting `grace * attempt` before each try. A file that is
/// already gone counts as deleted.
async fn delete_with_retries<R>(path: &Path, grace: Duration, retries: u32, remove: &mut R) -> bool
where
    R: FnMut(&Path) -> io::Result<()>,
{
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        tokio::time::sleep(grace * attempt).await;
        match remove(path) {
            Ok(()) => {
                debug!("🗑️ Deleted {}", path.display());
                return true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) if attempt < attempts => {
                debug!("Delete of {} failed (attempt {}/{}): {}", path.display(), attempt, attempts, e);
            }
            Err(e) => {
                warn!("⚠️ Giving up on deleting {} after {} attempts: {}", path.display(), attempts, e);
            }
        }
    }
    false
}
