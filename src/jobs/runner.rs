use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::asr::Recognizer as _;
use crate::engines;
use crate::engines::PackEntry;
use crate::jobs::manager::JobManager;
use crate::jobs::types::*;
use crate::jobs::intake;

/// Name of the transcoded intermediate inside a job/item directory.
pub(crate) const ASR_WAV: &str = "asr.wav";
/// Directory the separator writes its raw tree into.
pub(crate) const SEPARATED_DIR: &str = "separated";

/// Drive one job through its stage sequence. Runs inside the serial engine
/// queue, so it is the only mutator of this job while it executes.
pub async fn run_job(manager: Arc<JobManager>, job_id: String) {
    let started = manager
        .update_job(&job_id, |job| {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        })
        .await;
    let Some(job) = started else {
        error!("job {job_id} vanished before it could run");
        return;
    };

    info!("job {job_id}: starting {} pipeline", job.job_type);
    let ttl = chrono::Duration::from_std(manager.config().job_ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(21600));
    match drive(&manager, &job_id, &job).await {
        Ok(()) => {
            manager
                .update_job(&job_id, |job| {
                    job.state = JobState::Succeeded;
                    job.phase = JobPhase::Done;
                    job.finished_at = Some(Utc::now());
                    job.expires_at = Some(Utc::now() + ttl);
                })
                .await;
            info!("job {job_id}: succeeded");
        }
        Err(e) => {
            error!("job {job_id}: failed: {e}");
            manager
                .update_job(&job_id, |job| {
                    job.state = JobState::Failed;
                    job.phase = JobPhase::Error;
                    job.error = Some(e);
                    job.finished_at = Some(Utc::now());
                    job.expires_at = Some(Utc::now() + ttl);
                })
                .await;
        }
    }

    // owned inputs are deleted exactly once, at the terminal transition
    intake::release_input(job.audio_path.as_deref(), job.cleanup_audio_on_finish).await;
}

async fn drive(manager: &Arc<JobManager>, job_id: &str, job: &Job) -> Result<(), JobError> {
    let config = manager.config().clone();
    let out_dir = job.out_dir.clone();
    let audio_path = job
        .audio_path
        .clone()
        .ok_or_else(|| JobError::internal("job has no materialized input"))?;

    if job.job_type.wants_asr() {
        set_phase(manager, job_id, JobPhase::AsrConvert).await;
        let wav = out_dir.join(ASR_WAV);
        engines::transcode_to_wav(&config, &audio_path, &wav).await?;

        set_phase(manager, job_id, JobPhase::Asr).await;
        let srt_src = manager
            .asr()
            .recognize(&wav, &out_dir, job.vad_max_single_segment_ms, job.vad_max_end_silence_ms)
            .await?;

        // the recognizer picks its own output location; pin it down
        let srt = out_dir.join(SRT_FILE);
        if srt_src != srt {
            intake::move_file(&srt_src, &srt).await?;
        }
        publish_artifact(manager, job_id, ART_SRT, &srt).await?;

        if let Err(e) = tokio::fs::remove_file(&wav).await {
            warn!("job {job_id}: failed to remove {ASR_WAV}: {e}");
        }
    }

    if job.job_type.wants_demucs() {
        set_phase(manager, job_id, JobPhase::Demucs).await;
        let sep_dir = out_dir.join(SEPARATED_DIR);
        let stems = engines::separate_two_stems(&config, &audio_path, &sep_dir).await?;

        let vocals = out_dir.join(VOCALS_FILE);
        let no_vocals = out_dir.join(NO_VOCALS_FILE);
        intake::move_file(&stems.vocals, &vocals).await?;
        intake::move_file(&stems.no_vocals, &no_vocals).await?;
        publish_artifact(manager, job_id, ART_VOCALS, &vocals).await?;
        publish_artifact(manager, job_id, ART_NO_VOCALS, &no_vocals).await?;

        set_phase(manager, job_id, JobPhase::ZipDemucs).await;
        let demucs_zip = out_dir.join(DEMUCS_ZIP_FILE);
        engines::pack_zip(
            &config,
            &demucs_zip,
            &[
                PackEntry::new(&vocals, VOCALS_FILE),
                PackEntry::new(&no_vocals, NO_VOCALS_FILE),
            ],
        )
        .await?;
        publish_artifact(manager, job_id, ART_DEMUCS_ZIP, &demucs_zip).await?;

        if job.job_type.wants_asr() {
            set_phase(manager, job_id, JobPhase::ZipResult).await;
            let result_zip = out_dir.join(RESULT_ZIP_FILE);
            engines::pack_zip(
                &config,
                &result_zip,
                &[
                    PackEntry::new(out_dir.join(SRT_FILE), SRT_FILE),
                    PackEntry::new(&vocals, VOCALS_FILE),
                    PackEntry::new(&no_vocals, NO_VOCALS_FILE),
                ],
            )
            .await?;
            publish_artifact(manager, job_id, ART_RESULT_ZIP, &result_zip).await?;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&sep_dir).await {
            warn!("job {job_id}: failed to remove separator tree: {e}");
        }
    }

    Ok(())
}

async fn set_phase(manager: &Arc<JobManager>, job_id: &str, phase: JobPhase) {
    manager.update_job(job_id, |job| job.phase = phase).await;
}

/// Stat a produced file, record it on the job, and persist so polling
/// clients can see it immediately.
async fn publish_artifact(
    manager: &Arc<JobManager>,
    job_id: &str,
    key: &str,
    path: &Path,
) -> Result<(), JobError> {
    let artifact = stat_artifact(key, path).await?;
    manager
        .update_job(job_id, |job| {
            job.artifacts.insert(key.to_string(), artifact);
        })
        .await;
    Ok(())
}

pub(crate) async fn stat_artifact(key: &str, path: &Path) -> Result<Artifact, JobError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| JobError::internal(format!("produced artifact missing at {}: {e}", path.display())))?;
    let name = artifact_file_name(key)
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| key.to_string());
    Ok(Artifact { name, path: PathBuf::from(path), ready: true, bytes: Some(meta.len()) })
}
