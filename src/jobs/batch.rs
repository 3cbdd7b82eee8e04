use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::asr::Recognizer as _;
use crate::engines;
use crate::engines::PackEntry;
use crate::jobs::manager::JobManager;
use crate::jobs::runner::{stat_artifact, ASR_WAV, SEPARATED_DIR};
use crate::jobs::types::*;
use crate::jobs::intake;

/// Drive a batch with the stage-first policy: ASR for every item first, so
/// early SRTs are downloadable while separation is still pending, then
/// separation for every item. Runs inside the serial engine queue.
pub async fn run_batch(manager: Arc<JobManager>, batch_id: String) {
    let started = manager
        .update_batch(&batch_id, |batch| {
            batch.state = BatchState::Running;
            batch.phase = BatchPhase::Validate;
            batch.started_at = Some(Utc::now());
        })
        .await;
    let Some(batch) = started else {
        error!("batch {batch_id} vanished before it could run");
        return;
    };

    let tasks = batch.options.tasks;
    info!(
        "batch {batch_id}: starting stage-first run over {} item(s) (asr={} demucs={})",
        batch.items.len(),
        tasks.asr,
        tasks.demucs
    );

    let mut canceled = false;
    if tasks.asr {
        canceled = asr_stage(&manager, &batch_id, &batch).await;
    }
    if tasks.demucs && !canceled {
        canceled = demucs_stage(&manager, &batch_id, &batch).await;
    }

    finalize(&manager, &batch_id, canceled).await;
}

/// Stage 1: transcode + recognize each item in index order. Returns true
/// when the batch was canceled partway through.
async fn asr_stage(manager: &Arc<JobManager>, batch_id: &str, batch: &Batch) -> bool {
    let tasks = batch.options.tasks;
    manager.update_batch(batch_id, |b| b.phase = BatchPhase::Asr).await;

    for idx in 0..batch.items.len() {
        if cancel_requested(manager, batch_id).await {
            cancel_queued_items(manager, batch_id).await;
            return true;
        }
        if !item_is_queued(manager, batch_id, idx).await {
            continue;
        }

        if let Err(e) = run_item_asr(manager, batch_id, batch, idx).await {
            warn!("batch {batch_id} item {idx}: asr stage failed: {e}");
            fail_item(manager, batch_id, idx, e).await;
            continue;
        }

        if tasks.demucs {
            // back to the queue for stage 2
            manager
                .update_batch(batch_id, |b| {
                    if let Some(item) = b.items.get_mut(idx) {
                        item.state = ItemState::Queued;
                        item.phase = JobPhase::Queued;
                    }
                })
                .await;
        } else {
            succeed_item(manager, batch_id, idx).await;
        }
    }
    false
}

/// Stage 2: separate + pack each still-queued item in index order.
async fn demucs_stage(manager: &Arc<JobManager>, batch_id: &str, batch: &Batch) -> bool {
    manager.update_batch(batch_id, |b| b.phase = BatchPhase::Demucs).await;

    for idx in 0..batch.items.len() {
        if cancel_requested(manager, batch_id).await {
            cancel_queued_items(manager, batch_id).await;
            return true;
        }
        if !item_is_queued(manager, batch_id, idx).await {
            continue;
        }

        if let Err(e) = run_item_demucs(manager, batch_id, batch, idx).await {
            warn!("batch {batch_id} item {idx}: demucs stage failed: {e}");
            fail_item(manager, batch_id, idx, e).await;
            continue;
        }
        succeed_item(manager, batch_id, idx).await;
    }
    false
}

async fn run_item_asr(
    manager: &Arc<JobManager>,
    batch_id: &str,
    batch: &Batch,
    idx: usize,
) -> Result<(), JobError> {
    let config = manager.config().clone();
    let item_dir = batch.out_dir.join("items").join(idx.to_string());
    tokio::fs::create_dir_all(&item_dir)
        .await
        .map_err(|e| JobError::internal(format!("failed to create item dir: {e}")))?;

    let audio_path = item_audio_path(manager, batch_id, idx).await?;

    set_item_phase(manager, batch_id, idx, ItemState::Running, JobPhase::AsrConvert, true).await;
    let wav = item_dir.join(ASR_WAV);
    engines::transcode_to_wav(&config, &audio_path, &wav).await?;

    set_item_phase(manager, batch_id, idx, ItemState::Running, JobPhase::Asr, false).await;
    let srt_src = manager
        .asr()
        .recognize(
            &wav,
            &item_dir,
            batch.options.vad_max_single_segment_ms,
            batch.options.vad_max_end_silence_ms,
        )
        .await?;

    let srt = item_dir.join(SRT_FILE);
    if srt_src != srt {
        intake::move_file(&srt_src, &srt).await?;
    }
    publish_item_artifact(manager, batch_id, idx, ART_SRT, &srt).await?;

    if let Err(e) = tokio::fs::remove_file(&wav).await {
        warn!("batch {batch_id} item {idx}: failed to remove {ASR_WAV}: {e}");
    }
    Ok(())
}

async fn run_item_demucs(
    manager: &Arc<JobManager>,
    batch_id: &str,
    batch: &Batch,
    idx: usize,
) -> Result<(), JobError> {
    let config = manager.config().clone();
    let tasks = batch.options.tasks;
    let item_dir = batch.out_dir.join("items").join(idx.to_string());
    tokio::fs::create_dir_all(&item_dir)
        .await
        .map_err(|e| JobError::internal(format!("failed to create item dir: {e}")))?;

    let audio_path = item_audio_path(manager, batch_id, idx).await?;

    set_item_phase(manager, batch_id, idx, ItemState::Running, JobPhase::Demucs, true).await;
    let sep_dir = item_dir.join(SEPARATED_DIR);
    let stems = engines::separate_two_stems(&config, &audio_path, &sep_dir).await?;

    let vocals = item_dir.join(VOCALS_FILE);
    let no_vocals = item_dir.join(NO_VOCALS_FILE);
    intake::move_file(&stems.vocals, &vocals).await?;
    intake::move_file(&stems.no_vocals, &no_vocals).await?;
    publish_item_artifact(manager, batch_id, idx, ART_VOCALS, &vocals).await?;
    publish_item_artifact(manager, batch_id, idx, ART_NO_VOCALS, &no_vocals).await?;

    set_item_phase(manager, batch_id, idx, ItemState::Running, JobPhase::ZipDemucs, false).await;
    let demucs_zip = item_dir.join(DEMUCS_ZIP_FILE);
    engines::pack_zip(
        &config,
        &demucs_zip,
        &[PackEntry::new(&vocals, VOCALS_FILE), PackEntry::new(&no_vocals, NO_VOCALS_FILE)],
    )
    .await?;
    publish_item_artifact(manager, batch_id, idx, ART_DEMUCS_ZIP, &demucs_zip).await?;

    // the combined archive only makes sense when stage 1 produced an SRT
    let srt_ready = manager
        .get_batch(batch_id)
        .await
        .and_then(|b| b.items.get(idx).and_then(|i| i.artifacts.get(ART_SRT).cloned()))
        .is_some_and(|a| a.ready);
    if tasks.asr && srt_ready {
        set_item_phase(manager, batch_id, idx, ItemState::Running, JobPhase::ZipResult, false)
            .await;
        let result_zip = item_dir.join(RESULT_ZIP_FILE);
        engines::pack_zip(
            &config,
            &result_zip,
            &[
                PackEntry::new(item_dir.join(SRT_FILE), SRT_FILE),
                PackEntry::new(&vocals, VOCALS_FILE),
                PackEntry::new(&no_vocals, NO_VOCALS_FILE),
            ],
        )
        .await?;
        publish_item_artifact(manager, batch_id, idx, ART_RESULT_ZIP, &result_zip).await?;
    }

    if let Err(e) = tokio::fs::remove_dir_all(&sep_dir).await {
        warn!("batch {batch_id} item {idx}: failed to remove separator tree: {e}");
    }
    Ok(())
}

/// Batch termination: `canceled` beats nothing, `failed` beats `canceled`.
async fn finalize(manager: &Arc<JobManager>, batch_id: &str, canceled: bool) {
    let ttl = chrono::Duration::from_std(manager.config().job_ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(21600));
    let finished = manager
        .update_batch(batch_id, |batch| {
            let counts = batch.counts();
            batch.state = if counts.failed > 0 {
                BatchState::Failed
            } else if canceled || counts.canceled > 0 {
                BatchState::Canceled
            } else {
                BatchState::Succeeded
            };
            batch.phase = BatchPhase::Done;
            batch.finished_at = Some(Utc::now());
            batch.expires_at = Some(Utc::now() + ttl);
        })
        .await;
    if let Some(batch) = finished {
        info!("batch {batch_id}: finished as {:?} ({:?})", batch.state, batch.counts());
    }
}

async fn cancel_requested(manager: &Arc<JobManager>, batch_id: &str) -> bool {
    manager.get_batch(batch_id).await.map(|b| b.cancel_requested).unwrap_or(false)
}

/// Mark every still-queued item canceled; in-flight work is never
/// interrupted, so by the time this runs nothing is mid-engine.
async fn cancel_queued_items(manager: &Arc<JobManager>, batch_id: &str) {
    manager
        .update_batch(batch_id, |batch| {
            for item in &mut batch.items {
                if item.state == ItemState::Queued {
                    item.state = ItemState::Canceled;
                    item.phase = JobPhase::Done;
                    item.finished_at = Some(Utc::now());
                }
            }
        })
        .await;
    release_terminal_inputs(manager, batch_id).await;
    info!("batch {batch_id}: canceled remaining queued items");
}

async fn item_is_queued(manager: &Arc<JobManager>, batch_id: &str, idx: usize) -> bool {
    manager
        .get_batch(batch_id)
        .await
        .and_then(|b| b.items.get(idx).map(|i| i.state == ItemState::Queued))
        .unwrap_or(false)
}

async fn item_audio_path(
    manager: &Arc<JobManager>,
    batch_id: &str,
    idx: usize,
) -> Result<PathBuf, JobError> {
    manager
        .get_batch(batch_id)
        .await
        .and_then(|b| b.items.get(idx).and_then(|i| i.audio_path.clone()))
        .ok_or_else(|| JobError::internal("batch item has no materialized input"))
}

async fn set_item_phase(
    manager: &Arc<JobManager>,
    batch_id: &str,
    idx: usize,
    state: ItemState,
    phase: JobPhase,
    mark_started: bool,
) {
    manager
        .update_batch(batch_id, |batch| {
            if let Some(item) = batch.items.get_mut(idx) {
                item.state = state;
                item.phase = phase;
                if mark_started && item.started_at.is_none() {
                    item.started_at = Some(Utc::now());
                }
            }
        })
        .await;
}

async fn fail_item(manager: &Arc<JobManager>, batch_id: &str, idx: usize, error: JobError) {
    let snapshot = manager
        .update_batch(batch_id, |batch| {
            if let Some(item) = batch.items.get_mut(idx) {
                item.state = ItemState::Failed;
                item.phase = JobPhase::Error;
                item.finished_at = Some(Utc::now());
                item.error = Some(error);
            }
        })
        .await;
    if let Some(batch) = snapshot {
        if let Some(item) = batch.items.get(idx) {
            intake::release_input(item.audio_path.as_deref(), item.owned_input).await;
        }
    }
}

async fn succeed_item(manager: &Arc<JobManager>, batch_id: &str, idx: usize) {
    let snapshot = manager
        .update_batch(batch_id, |batch| {
            if let Some(item) = batch.items.get_mut(idx) {
                item.state = ItemState::Succeeded;
                item.phase = JobPhase::Done;
                item.finished_at = Some(Utc::now());
            }
        })
        .await;
    if let Some(batch) = snapshot {
        if let Some(item) = batch.items.get(idx) {
            intake::release_input(item.audio_path.as_deref(), item.owned_input).await;
        }
    }
}

async fn release_terminal_inputs(manager: &Arc<JobManager>, batch_id: &str) {
    if let Some(batch) = manager.get_batch(batch_id).await {
        for item in &batch.items {
            if item.state == ItemState::Canceled {
                intake::release_input(item.audio_path.as_deref(), item.owned_input).await;
            }
        }
    }
}

async fn publish_item_artifact(
    manager: &Arc<JobManager>,
    batch_id: &str,
    idx: usize,
    key: &str,
    path: &std::path::Path,
) -> Result<(), JobError> {
    let artifact = stat_artifact(key, path).await?;
    manager
        .update_batch(batch_id, |batch| {
            if let Some(item) = batch.items.get_mut(idx) {
                item.artifacts.insert(key.to_string(), artifact);
            }
        })
        .await;
    Ok(())
}
