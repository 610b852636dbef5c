use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use engine::{
    config::clamp_workers,
    disk, session,
    BatchEngine, CommandTemplate, EngineConfig, EngineError, FolderState, InstanceLock, LockRole,
    SessionState, StopSignal,
};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Unattended OCR batch worker over a folder queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of concurrent workers (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process a single batch, then exit
    #[arg(long)]
    once: bool,

    /// Print folder statistics and lock owners, then exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(workers) = args.workers {
        cfg.num_workers = clamp_workers(workers);
    }

    if args.status {
        print_status(&cfg);
        return Ok(());
    }

    info!("OCR batch worker starting");
    info!("Configuration loaded:");
    info!("  Input: {}", cfg.folders.incoming.display());
    info!("  Output: {}", cfg.folders.done.display());
    info!("  Failed: {}", cfg.folders.failed.display());
    info!("  Tool: {}", cfg.tool.program.display());
    info!("  Language: {}, DPI: {}", cfg.options.language, cfg.options.dpi);
    info!("  Workers: {} (recommended for this machine: {})", cfg.num_workers, EngineConfig::recommended_workers());
    info!("  Retries: {}, timeout: {}s", cfg.max_retries, cfg.job_timeout_secs);

    let tool = Arc::new(CommandTemplate::new(cfg.tool.clone()));
    let engine = BatchEngine::new(cfg.clone(), tool, LockRole::Unattended);

    // Held for the whole run so batches do not hand it back and forth
    if !engine.lock().acquire().context("Failed to acquire instance lock")? {
        let other = engine.lock().counterpart();
        if other.is_locked() {
            return Err(EngineError::RoleConflict { role: LockRole::Unattended, other: other.role() }.into());
        }
        return Err(EngineError::InstanceLocked {
            role: LockRole::Unattended,
            pid: engine.lock().owner_pid().unwrap_or(0),
        }
        .into());
    }

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("⏹️ Ctrl-C received, finishing in-flight jobs");
                stop.request();
            }
        });
    }

    let outcome = run(&engine, &cfg, &stop, args.once).await;

    if let Err(e) = engine.lock().release() {
        warn!("⚠️ Failed to release lock: {:#}", e);
    }
    outcome
}

async fn run(engine: &BatchEngine, cfg: &EngineConfig, stop: &StopSignal, once: bool) -> Result<()> {
    if let Some(previous) = SessionState::load(&cfg.session_file)? {
        let (processed, failed, total) = previous.progress();
        info!(
            "🔄 Previous session {} ended at {}/{} ({} failed); leftovers will be recovered",
            previous.session_id,
            processed + failed,
            total,
            failed
        );
    }

    let mut session = SessionState::new(cfg.folders.clone(), pending_files(cfg));
    session.save(&cfg.session_file)?;

    loop {
        let queued = pending_files(cfg);
        session.total_files = session.finished() + queued;
        if queued > 0 {
            info!("{} file(s) waiting", queued);
        }

        let session_file = cfg.session_file.clone();
        let batch = engine
            .process_batch(
                |result| {
                    if result.success {
                        info!("✅ {} ({:.1}s)", result.file_name, result.duration.as_secs_f64());
                    } else {
                        error!(
                            "❌ {}: {} - {}",
                            result.file_name,
                            result.message,
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                    session.record(result);
                    let (processed, failed, total) = session.progress();
                    info!(
                        "Progress: {}/{} done, {} failed, ETA {}",
                        processed + failed,
                        total,
                        failed,
                        session.eta()
                    );
                    if let Err(e) = session.save(&session_file) {
                        warn!("⚠️ Could not save session state: {:#}", e);
                    }
                },
                stop,
            )
            .await;

        match batch {
            Ok(summary) if summary.total() > 0 => {
                info!(
                    "Batch finished: {} succeeded, {} failed (elapsed {})",
                    summary.succeeded,
                    summary.failed,
                    session::format_time(session.elapsed_secs())
                );
            }
            Ok(_) => debug!("Queue empty"),
            Err(e) => match e.downcast_ref::<EngineError>() {
                Some(EngineError::InsufficientDiskSpace { .. }) | Some(EngineError::ToolUnavailable(_)) => {
                    error!("❌ {:#}", e);
                    return Err(e);
                }
                Some(_) if !once => warn!("⚠️ Batch refused: {:#}", e),
                _ => return Err(e),
            },
        }

        if once || stop.is_requested() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.poll_interval()) => {}
            _ = stop.stopped() => break,
        }
    }

    let (processed, failed, _) = session.progress();
    info!("Session {} finished: {} converted, {} failed", session.session_id, processed, failed);
    session.save(&cfg.session_file)?;
    Ok(())
}

/// Files still to be handled: waiting in the input folder or left in flight
fn pending_files(cfg: &EngineConfig) -> usize {
    [FolderState::Incoming, FolderState::InFlight]
        .iter()
        .map(|state| session::folder_stats(cfg.folders.dir(*state), &cfg.supported_extensions).count)
        .sum()
}

fn print_status(cfg: &EngineConfig) {
    println!("Folders:");
    for (state, stats) in session::layout_stats(&cfg.folders, &cfg.supported_extensions) {
        if stats.exists {
            println!("  {:<10} {:>6} file(s)  {:>10}  {}", state.to_string(), stats.count, stats.size_display(), cfg.folders.dir(state).display());
        } else {
            println!("  {:<10} {:>6}            {:>10}  {} (missing)", state.to_string(), "-", "-", cfg.folders.dir(state).display());
        }
    }

    match disk::free_space(&cfg.folders.done) {
        Some(free) => println!("Free space on output volume: {}", format_size(free, DECIMAL)),
        None => println!("Free space on output volume: unknown"),
    }

    println!("Locks:");
    for role in [LockRole::Interactive, LockRole::Unattended] {
        let lock = InstanceLock::new(&cfg.lock_dir, role);
        match lock.owner_pid() {
            Some(pid) if lock.is_locked() => println!("  {:<12} held by PID {}", role.to_string(), pid),
            Some(pid) => println!("  {:<12} stale (PID {} is gone)", role.to_string(), pid),
            None => println!("  {:<12} free", role.to_string()),
        }
    }

    match SessionState::load(&cfg.session_file) {
        Ok(Some(state)) => {
            let (processed, failed, total) = state.progress();
            println!("Last session {}:", state.session_id);
            println!("  Started: {}", state.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
            if let Some(updated) = state.last_update {
                println!("  Updated: {}", updated.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
            }
            println!("  Progress: {}/{} ({} failed), ETA {}", processed + failed, total, failed, state.eta());
        }
        Ok(None) => println!("No session recorded"),
        Err(e) => println!("Session file unreadable: {:#}", e),
    }
}
