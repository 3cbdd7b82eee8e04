use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::types::{Artifact, Batch, Job, JobError};

pub const JOB_META: &str = "job.json";
pub const BATCH_META: &str = "batch.json";

/// Atomically replace `dir/<name>` with the serialized value.
///
/// The value is written to a unique temp file in the same directory and
/// renamed into place. On filesystems where rename refuses to clobber an
/// existing file, the target is removed and the rename retried once.
pub async fn write_meta_atomic<T: Serialize>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<(), JobError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| JobError::internal(format!("failed to serialize metadata: {e}")))?;

    let tmp = dir.join(format!("{name}.tmp.{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &data)
        .await
        .map_err(|e| JobError::internal(format!("failed to write {}: {e}", tmp.display())))?;

    let dest = dir.join(name);
    match tokio::fs::rename(&tmp, &dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let _ = tokio::fs::remove_file(&dest).await;
            tokio::fs::rename(&tmp, &dest).await.map_err(|e| {
                JobError::internal(format!("failed to replace {}: {e}", dest.display()))
            })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(JobError::internal(format!("failed to rename into {}: {e}", dest.display())))
        }
    }
}

pub async fn persist_job(job: &Job) -> Result<(), JobError> {
    write_meta_atomic(&job.out_dir, JOB_META, job).await
}

pub async fn persist_batch(batch: &Batch) -> Result<(), JobError> {
    write_meta_atomic(&batch.out_dir, BATCH_META, batch).await
}

/// Load a job record from `dir`, or `None` when the metadata file is missing
/// or malformed (the directory is then treated as orphaned).
///
/// The stored `outDir` is rewritten to the directory actually loaded from,
/// and every artifact is reconciled against the filesystem.
pub async fn load_job(dir: &Path) -> Option<Job> {
    let raw = match tokio::fs::read(dir.join(JOB_META)).await {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    let mut job: Job = match serde_json::from_slice(&raw) {
        Ok(job) => job,
        Err(e) => {
            warn!("malformed job metadata in {}: {e}", dir.display());
            return None;
        }
    };

    let old_out = std::mem::replace(&mut job.out_dir, dir.to_path_buf());
    job.audio_path = job.audio_path.take().map(|p| rebase(&p, &old_out, dir));
    reconcile_artifacts(&mut job.artifacts, &old_out, dir).await;
    Some(job)
}

/// Batch counterpart of [`load_job`]; item artifacts are reconciled the same
/// way, keyed off the batch directory.
pub async fn load_batch(dir: &Path) -> Option<Batch> {
    let raw = match tokio::fs::read(dir.join(BATCH_META)).await {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    let mut batch: Batch = match serde_json::from_slice(&raw) {
        Ok(batch) => batch,
        Err(e) => {
            warn!("malformed batch metadata in {}: {e}", dir.display());
            return None;
        }
    };

    let old_out = std::mem::replace(&mut batch.out_dir, dir.to_path_buf());
    for item in &mut batch.items {
        item.audio_path = item.audio_path.take().map(|p| rebase(&p, &old_out, dir));
        reconcile_artifacts(&mut item.artifacts, &old_out, dir).await;
    }
    Some(batch)
}

/// Re-anchor a persisted path: relative paths resolve against the current
/// directory, and absolute paths under the old `outDir` move with it.
fn rebase(path: &Path, old_root: &Path, new_root: &Path) -> PathBuf {
    if path.is_relative() {
        return new_root.join(path);
    }
    match path.strip_prefix(old_root) {
        Ok(rest) => new_root.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Make each artifact's `ready` flag agree with the filesystem: `ready=true`
/// with a byte count when the file is a regular file, `ready=false` with
/// `bytes` dropped otherwise. Never deletes anything.
async fn reconcile_artifacts(
    artifacts: &mut BTreeMap<String, Artifact>,
    old_root: &Path,
    new_root: &Path,
) {
    for artifact in artifacts.values_mut() {
        artifact.path = rebase(&artifact.path, old_root, new_root);
        match tokio::fs::metadata(&artifact.path).await {
            Ok(meta) if meta.is_file() => {
                artifact.ready = true;
                artifact.bytes = Some(meta.len());
            }
            _ => {
                if artifact.ready {
                    debug!("artifact {} vanished, marking not ready", artifact.path.display());
                }
                artifact.ready = false;
                artifact.bytes = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_job(out_dir: &Path) -> Job {
        Job {
            id: "job-test".into(),
            job_type: JobType::Asr,
            state: JobState::Queued,
            phase: JobPhase::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
            out_dir: out_dir.to_path_buf(),
            source: SourceKind::AudioPath,
            audio_path: Some(out_dir.join("input.wav")),
            cleanup_audio_on_finish: false,
            vad_max_single_segment_ms: Some(8000),
            vad_max_end_silence_ms: None,
            artifacts: BTreeMap::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn meta_round_trip() {
        let dir = tempdir().unwrap();
        let job = sample_job(dir.path());
        persist_job(&job).await.unwrap();

        let loaded = load_job(dir.path()).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.job_type, job.job_type);
        assert_eq!(loaded.out_dir, dir.path());
        assert_eq!(loaded.vad_max_single_segment_ms, Some(8000));
    }

    #[tokio::test]
    async fn load_is_absent_for_missing_or_malformed_meta() {
        let dir = tempdir().unwrap();
        assert!(load_job(dir.path()).await.is_none());

        tokio::fs::write(dir.path().join(JOB_META), b"{not json").await.unwrap();
        assert!(load_job(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn reconciliation_clears_stale_ready_flags() {
        let dir = tempdir().unwrap();
        let mut job = sample_job(dir.path());

        // declared ready but never written to disk
        job.artifacts.insert(
            ART_SRT.into(),
            Artifact {
                name: SRT_FILE.into(),
                path: dir.path().join(SRT_FILE),
                ready: true,
                bytes: Some(123),
            },
        );
        // present on disk but declared not ready
        let vocals = dir.path().join(VOCALS_FILE);
        tokio::fs::write(&vocals, b"mp3data").await.unwrap();
        job.artifacts.insert(
            ART_VOCALS.into(),
            Artifact { name: VOCALS_FILE.into(), path: vocals.clone(), ready: false, bytes: None },
        );

        persist_job(&job).await.unwrap();
        let loaded = load_job(dir.path()).await.unwrap();

        let srt = &loaded.artifacts[ART_SRT];
        assert!(!srt.ready);
        assert_eq!(srt.bytes, None);

        let vocals = &loaded.artifacts[ART_VOCALS];
        assert!(vocals.ready);
        assert_eq!(vocals.bytes, Some(7));
    }

    #[tokio::test]
    async fn reconciliation_is_a_fixed_point() {
        let dir = tempdir().unwrap();
        let mut job = sample_job(dir.path());
        let srt = dir.path().join(SRT_FILE);
        tokio::fs::write(&srt, b"1\n").await.unwrap();
        job.artifacts.insert(
            ART_SRT.into(),
            Artifact { name: SRT_FILE.into(), path: srt, ready: false, bytes: None },
        );
        persist_job(&job).await.unwrap();

        let first = load_job(dir.path()).await.unwrap();
        persist_job(&first).await.unwrap();
        let second = load_job(dir.path()).await.unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn paths_are_rebased_when_directory_moves() {
        let dir = tempdir().unwrap();
        let mut job = sample_job(Path::new("/mnt/old-host/jobs-v2/job-test"));
        job.artifacts.insert(
            ART_SRT.into(),
            Artifact {
                name: SRT_FILE.into(),
                path: PathBuf::from("/mnt/old-host/jobs-v2/job-test/output.srt"),
                ready: true,
                bytes: Some(2),
            },
        );
        tokio::fs::write(dir.path().join(SRT_FILE), b"1\n").await.unwrap();
        write_meta_atomic(dir.path(), JOB_META, &job).await.unwrap();

        let loaded = load_job(dir.path()).await.unwrap();
        assert_eq!(loaded.out_dir, dir.path());
        assert_eq!(loaded.audio_path.unwrap(), dir.path().join("input.wav"));
        let srt = &loaded.artifacts[ART_SRT];
        assert_eq!(srt.path, dir.path().join(SRT_FILE));
        assert!(srt.ready);
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_meta() {
        let dir = tempdir().unwrap();
        let mut job = sample_job(dir.path());
        persist_job(&job).await.unwrap();
        job.state = JobState::Running;
        persist_job(&job).await.unwrap();

        let loaded = load_job(dir.path()).await.unwrap();
        assert_eq!(loaded.state, JobState::Running);

        // no temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().into_string().unwrap());
        }
        assert_eq!(names, vec![JOB_META.to_string()]);
    }
}
