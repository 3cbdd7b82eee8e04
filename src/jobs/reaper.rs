use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::jobs::manager::JobManager;
use crate::jobs::types::*;
use crate::store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the background TTL sweep.
pub fn spawn(manager: Arc<JobManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep(&manager).await {
                error!("reaper sweep failed: {e}");
            }
        }
    })
}

/// Drop expired terminal records from memory and delete their directories.
/// Idempotent: a directory that is already gone is not an error.
pub async fn sweep(manager: &Arc<JobManager>) -> Result<()> {
    for job in manager.expired_jobs().await {
        info!("reaping expired job {}", job.id);
        manager.drop_job(&job.id).await;
        remove_dir(&job.out_dir).await;
    }
    for batch in manager.expired_batches().await {
        info!("reaping expired batch {}", batch.id);
        manager.drop_batch(&batch.id).await;
        remove_dir(&batch.out_dir).await;
    }
    Ok(())
}

/// Reconcile the persistence directories after a restart.
///
/// Expired terminal entries are deleted; entries that were queued or running
/// when the process died are failed (no resume); unparseable directories are
/// deleted once older than the TTL.
pub async fn startup_sweep(manager: &Arc<JobManager>) -> Result<()> {
    let config = manager.config().clone();
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(config.job_ttl).unwrap_or_else(|_| chrono::Duration::seconds(21600));

    for dir in list_dirs(&config.jobs_dir()).await? {
        match store::load_job(&dir).await {
            Some(mut job) => {
                if job.is_terminal() {
                    if job.expires_at.is_some_and(|t| t <= now) {
                        info!("startup sweep: removing expired job {}", job.id);
                        remove_dir(&dir).await;
                    } else {
                        manager.adopt_job(job).await;
                    }
                } else {
                    warn!("startup sweep: failing interrupted job {}", job.id);
                    job.state = JobState::Failed;
                    job.phase = JobPhase::Error;
                    job.error = Some(JobError::internal("interrupted by server restart"));
                    job.finished_at = Some(now);
                    job.expires_at = Some(now + ttl);
                    if let Err(e) = store::persist_job(&job).await {
                        error!("startup sweep: failed to persist job {}: {e}", job.id);
                    }
                    manager.adopt_job(job).await;
                }
            }
            None => reap_orphan(&dir, config.job_ttl).await,
        }
    }

    for dir in list_dirs(&config.batches_dir()).await? {
        match store::load_batch(&dir).await {
            Some(mut batch) => {
                if batch.is_terminal() {
                    if batch.expires_at.is_some_and(|t| t <= now) {
                        info!("startup sweep: removing expired batch {}", batch.id);
                        remove_dir(&dir).await;
                    } else {
                        manager.adopt_batch(batch).await;
                    }
                } else {
                    warn!("startup sweep: failing interrupted batch {}", batch.id);
                    batch.state = BatchState::Failed;
                    batch.phase = BatchPhase::Error;
                    batch.error = Some(JobError::internal("interrupted by server restart"));
                    for item in &mut batch.items {
                        if !item.state.is_terminal() {
                            item.state = ItemState::Failed;
                            item.phase = JobPhase::Error;
                            item.error = Some(JobError::internal("interrupted by server restart"));
                            item.finished_at = Some(now);
                        }
                    }
                    batch.finished_at = Some(now);
                    batch.expires_at = Some(now + ttl);
                    if let Err(e) = store::persist_batch(&batch).await {
                        error!("startup sweep: failed to persist batch {}: {e}", batch.id);
                    }
                    manager.adopt_batch(batch).await;
                }
            }
            None => reap_orphan(&dir, config.job_ttl).await,
        }
    }

    Ok(())
}

/// A directory without parseable metadata is eligible for removal once its
/// mtime is older than the TTL.
async fn reap_orphan(dir: &Path, ttl: Duration) {
    let age = match tokio::fs::metadata(dir).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().unwrap_or_default(),
        Err(e) => {
            warn!("startup sweep: cannot stat {}: {e}", dir.display());
            return;
        }
    };
    if age > ttl {
        info!("startup sweep: removing orphaned dir {}", dir.display());
        remove_dir(dir).await;
    }
}

async fn list_dirs(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return Ok(dirs),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {e}", dir.display()),
    }
}
