use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::time::sleep;

use crate::asr::AsrWorker;
use crate::config::Config;
use crate::jobs::manager::{JobManager, NewBatch, NewJob};
use crate::jobs::types::*;
use crate::jobs::reaper;
use crate::queue::SerialQueue;
use crate::store;

struct TestEnv {
    _root: TempDir,
    config: Arc<Config>,
    manager: Arc<JobManager>,
    engine_log: PathBuf,
}

/// Stand up a manager wired to shell-script stand-ins for the four engines.
/// `asr_delay_secs` slows the fake recognizer down for cancellation tests.
fn setup(asr_delay_secs: &str) -> TestEnv {
    let root = TempDir::new().unwrap();
    let engine_log = root.path().join("engine.log");
    let log = engine_log.display();

    let ffmpeg = write_script(
        root.path(),
        "ffmpeg.sh",
        &format!(
            r#"#!/bin/sh
in=""; prev=""; out=""
for a in "$@"; do
  [ "$prev" = "-i" ] && in="$a"
  prev="$a"; out="$a"
done
echo "transcode $in" >> "{log}"
[ -s "$in" ] || {{ echo "could not decode input" >&2; exit 1; }}
cp "$in" "$out"
"#
        ),
    );
    let demucs = write_script(
        root.path(),
        "demucs.sh",
        &format!(
            r#"#!/bin/sh
outdir=""; prev=""; in=""
for a in "$@"; do
  [ "$prev" = "-o" ] && outdir="$a"
  prev="$a"; in="$a"
done
echo "demucs $in" >> "{log}"
[ -s "$in" ] || {{ echo "could not decode input" >&2; exit 1; }}
mkdir -p "$outdir/htdemucs/track"
printf 'vocals-data' > "$outdir/htdemucs/track/vocals.mp3"
printf 'no-vocals-data' > "$outdir/htdemucs/track/no_vocals.mp3"
"#
        ),
    );
    let zip = write_script(
        root.path(),
        "zip.sh",
        r#"#!/bin/sh
shift 2
z="$1"; shift
cat "$@" > "$z"
"#,
    );
    let worker = write_script(
        root.path(),
        "worker.sh",
        &format!(
            r#"#!/bin/sh
printf '{{"type":"ready","pid":1,"device":"cpu","ncpu":1}}\n'
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  out=$(printf '%s' "$line" | sed -n 's/.*"outDir":"\([^"]*\)".*/\1/p')
  echo "asr $out" >> "{log}"
  sleep {asr_delay_secs}
  printf '1\n00:00:00,000 --> 00:00:01,000\nhello world\n\n' > "$out/raw.srt"
  printf '{{"type":"result","id":%s,"ok":true,"srtPath":"%s/raw.srt"}}\n' "$id" "$out"
done
"#
        ),
    );

    let config = Arc::new(Config {
        tmp_dir: root.path().join("data"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        api_token: None,
        job_ttl: Duration::from_secs(3600),
        demucs_mp3_bitrate: 256,
        demucs_jobs: 2,
        ffmpeg_bin: ffmpeg,
        demucs_bin: demucs,
        zip_bin: zip,
        asr_python_bin: PathBuf::from("/bin/sh"),
        asr_worker_script: worker,
        asr_idle_seconds: 60,
        max_download_bytes: None,
    });
    config.ensure_layout().unwrap();

    let queue = SerialQueue::new();
    let asr = AsrWorker::new(config.clone());
    let manager = JobManager::new(config.clone(), queue, asr);

    TestEnv { _root: root, config, manager, engine_log }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn audio_fixture(env: &TestEnv, name: &str) -> PathBuf {
    let path = env.config.tmp_dir.join(name);
    std::fs::write(&path, b"fake-audio-bytes").unwrap();
    path
}

fn engine_log_lines(env: &TestEnv) -> Vec<String> {
    std::fs::read_to_string(&env.engine_log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_job_terminal(env: &TestEnv, id: &str) -> Job {
    for _ in 0..200 {
        if let Some(job) = env.manager.get_job(id).await {
            if job.is_terminal() {
                return job;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} did not reach a terminal state");
}

async fn wait_batch_terminal(env: &TestEnv, id: &str) -> Batch {
    for _ in 0..200 {
        if let Some(batch) = env.manager.get_batch(id).await {
            if batch.is_terminal() {
                return batch;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("batch {id} did not reach a terminal state");
}

fn path_item(path: PathBuf) -> InputDescriptor {
    InputDescriptor::AudioPath { path }
}

#[tokio::test]
async fn asr_job_via_upload_produces_srt() {
    let env = setup("0");
    let spool = env.config.uploads_dir().join("upload-test.mp3");
    std::fs::write(&spool, b"fake-audio-bytes").unwrap();

    let job = env
        .manager
        .create_job(NewJob {
            job_type: "asr".into(),
            input: InputDescriptor::Upload {
                spool_path: spool.clone(),
                file_name: Some("song.mp3".into()),
            },
            vad_max_single_segment_ms: Some(8000),
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.source, SourceKind::Upload);
    assert!(job.cleanup_audio_on_finish);
    assert!(!spool.exists(), "spool must be moved into the job dir");

    let done = wait_job_terminal(&env, &job.id).await;
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.phase, JobPhase::Done);
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(done.expires_at.is_some());

    let srt = &done.artifacts[ART_SRT];
    assert!(srt.ready);
    assert_eq!(srt.name, SRT_FILE);
    let content = std::fs::read_to_string(&srt.path).unwrap();
    assert!(content.starts_with("1\n"));
    assert!(content.contains("00:00:00,000 --> 00:00:01,000"));

    // intermediate wav removed, owned input released at the terminal transition
    assert!(!done.out_dir.join(super::runner::ASR_WAV).exists());
    let input = done.audio_path.as_ref().unwrap();
    for _ in 0..100 {
        if !input.exists() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!input.exists());

    // persisted record agrees with memory after reconciliation
    let reloaded = store::load_job(&done.out_dir).await.unwrap();
    assert_eq!(reloaded.state, JobState::Succeeded);
    assert!(reloaded.artifacts[ART_SRT].ready);
}

#[tokio::test]
async fn demucs_job_via_local_path_keeps_input() {
    let env = setup("0");
    let local = audio_fixture(&env, "track.wav");

    let job = env
        .manager
        .create_job(NewJob {
            job_type: "demucs".into(),
            input: path_item(local.clone()),
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();

    let done = wait_job_terminal(&env, &job.id).await;
    assert_eq!(done.state, JobState::Succeeded);
    for key in [ART_VOCALS, ART_NO_VOCALS, ART_DEMUCS_ZIP] {
        assert!(done.artifacts[key].ready, "{key} should be ready");
        assert!(done.artifacts[key].path.is_file());
    }
    assert!(done.artifacts.get(ART_SRT).is_none());

    // unowned input untouched, raw separator tree removed
    assert!(local.exists());
    assert!(!done.out_dir.join(super::runner::SEPARATED_DIR).exists());
}

#[tokio::test]
async fn combined_job_publishes_all_artifacts() {
    let env = setup("0");
    let local = audio_fixture(&env, "track.wav");

    let job = env
        .manager
        .create_job(NewJob {
            job_type: "demucsasr".into(), // alias for asr-demucs
            input: path_item(local),
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();
    assert_eq!(job.job_type, JobType::AsrDemucs);

    let done = wait_job_terminal(&env, &job.id).await;
    assert_eq!(done.state, JobState::Succeeded);
    for key in [ART_SRT, ART_VOCALS, ART_NO_VOCALS, ART_DEMUCS_ZIP, ART_RESULT_ZIP] {
        assert!(done.artifacts[key].ready, "{key} should be ready");
    }
    assert_eq!(done.artifacts[ART_RESULT_ZIP].name, RESULT_ZIP_FILE);
}

#[tokio::test]
async fn undecodable_input_fails_with_bad_audio() {
    let env = setup("0");
    let empty = env.config.tmp_dir.join("empty.wav");
    std::fs::write(&empty, b"").unwrap();

    let job = env
        .manager
        .create_job(NewJob {
            job_type: "asr".into(),
            input: path_item(empty.clone()),
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();

    let done = wait_job_terminal(&env, &job.id).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.phase, JobPhase::Error);
    let error = done.error.unwrap();
    assert_eq!(error.code, ErrorCode::BadAudio);
    assert!(error.details.unwrap().contains("could not decode"));
    // the failing job never deletes an unowned input
    assert!(empty.exists());
}

#[tokio::test]
async fn job_creation_rejects_bad_parameters() {
    let env = setup("0");
    let local = audio_fixture(&env, "track.wav");

    let err = env
        .manager
        .create_job(NewJob {
            job_type: "transcribe".into(),
            input: path_item(local.clone()),
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    let err = env
        .manager
        .create_job(NewJob {
            job_type: "asr".into(),
            input: path_item(local),
            vad_max_single_segment_ms: Some(0),
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);
}

#[tokio::test]
async fn batch_runs_stage_first() {
    let env = setup("0");
    let items = (0..3)
        .map(|i| path_item(audio_fixture(&env, &format!("track{i}.wav"))))
        .collect();

    let batch = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: true },
            policy: None,
            items,
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();

    let done = wait_batch_terminal(&env, &batch.id).await;
    assert_eq!(done.state, BatchState::Succeeded);
    assert_eq!(done.phase, BatchPhase::Done);
    let counts = done.counts();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.succeeded, 3);

    for item in &done.items {
        for key in [ART_SRT, ART_VOCALS, ART_NO_VOCALS, ART_DEMUCS_ZIP, ART_RESULT_ZIP] {
            assert!(item.artifacts[key].ready, "item {} {key} should be ready", item.idx);
        }
    }

    // every ASR invocation happens before any separation starts
    let lines = engine_log_lines(&env);
    let last_asr = lines.iter().rposition(|l| l.starts_with("asr ")).unwrap();
    let first_demucs = lines.iter().position(|l| l.starts_with("demucs ")).unwrap();
    assert!(
        last_asr < first_demucs,
        "stage-first violated: asr at {last_asr}, demucs at {first_demucs}: {lines:?}"
    );
}

#[tokio::test]
async fn batch_item_failure_is_isolated() {
    let env = setup("0");
    let good0 = audio_fixture(&env, "good0.wav");
    let empty = env.config.tmp_dir.join("empty.wav");
    std::fs::write(&empty, b"").unwrap();
    let good2 = audio_fixture(&env, "good2.wav");

    let batch = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: true },
            policy: None,
            items: vec![path_item(good0), path_item(empty), path_item(good2)],
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();

    let done = wait_batch_terminal(&env, &batch.id).await;
    assert_eq!(done.state, BatchState::Failed);
    let counts = done.counts();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.succeeded, 2);

    let failed = &done.items[1];
    assert_eq!(failed.state, ItemState::Failed);
    assert_eq!(failed.error.as_ref().unwrap().code, ErrorCode::BadAudio);

    // the healthy neighbours still carry their artifacts
    assert!(done.items[0].artifacts[ART_RESULT_ZIP].ready);
    assert!(done.items[2].artifacts[ART_RESULT_ZIP].ready);
}

#[tokio::test]
async fn batch_cancel_spares_in_flight_item() {
    let env = setup("1");
    let items = (0..3)
        .map(|i| path_item(audio_fixture(&env, &format!("track{i}.wav"))))
        .collect();

    let batch = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: false },
            policy: None,
            items,
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();

    // wait for item 0 to be in the recognizer, then cancel
    for _ in 0..200 {
        if engine_log_lines(&env).iter().any(|l| l.starts_with("asr ")) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let snapshot = env.manager.cancel_batch(&batch.id).await.unwrap();
    assert!(snapshot.cancel_requested);

    let done = wait_batch_terminal(&env, &batch.id).await;
    assert_eq!(done.state, BatchState::Canceled);
    assert_eq!(done.phase, BatchPhase::Done);

    // the in-flight item ran to its natural end; the rest never started
    assert_eq!(done.items[0].state, ItemState::Succeeded);
    assert!(done.items[0].artifacts[ART_SRT].ready);
    assert_eq!(done.items[1].state, ItemState::Canceled);
    assert_eq!(done.items[2].state, ItemState::Canceled);
    assert!(done.items[1].artifacts.is_empty());
}

#[tokio::test]
async fn cancel_of_terminal_batch_is_a_noop() {
    let env = setup("0");
    let batch = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: false },
            policy: None,
            items: vec![path_item(audio_fixture(&env, "track.wav"))],
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap();
    let done = wait_batch_terminal(&env, &batch.id).await;
    assert_eq!(done.state, BatchState::Succeeded);

    let after = env.manager.cancel_batch(&batch.id).await.unwrap();
    assert_eq!(after.state, BatchState::Succeeded);
    assert!(!after.cancel_requested);

    let err = env.manager.cancel_batch("batch-unknown").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn batch_size_is_bounded() {
    let env = setup("0");
    let err = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: false },
            policy: None,
            items: Vec::new(),
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    let items = (0..11)
        .map(|i| path_item(audio_fixture(&env, &format!("track{i}.wav"))))
        .collect();
    let err = env
        .manager
        .create_batch(NewBatch {
            tasks: BatchTasks { asr: true, demucs: false },
            policy: None,
            items,
            vad_max_single_segment_ms: None,
            vad_max_end_silence_ms: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);
}

#[tokio::test]
async fn interrupted_job_is_failed_on_startup() {
    let env = setup("0");

    // simulate a record left mid-run by a crashed process
    let out_dir = env.config.jobs_dir().join("job-interrupted");
    std::fs::create_dir_all(&out_dir).unwrap();
    let job = Job {
        id: "job-interrupted".into(),
        job_type: JobType::Asr,
        state: JobState::Running,
        phase: JobPhase::AsrConvert,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        finished_at: None,
        expires_at: None,
        out_dir: out_dir.clone(),
        source: SourceKind::Upload,
        audio_path: Some(out_dir.join("input.mp3")),
        cleanup_audio_on_finish: true,
        vad_max_single_segment_ms: None,
        vad_max_end_silence_ms: None,
        artifacts: Default::default(),
        error: None,
    };
    store::persist_job(&job).await.unwrap();
    std::fs::write(out_dir.join("input.mp3"), b"partial").unwrap();

    reaper::startup_sweep(&env.manager).await.unwrap();

    let loaded = env.manager.get_job("job-interrupted").await.unwrap();
    assert_eq!(loaded.state, JobState::Failed);
    assert_eq!(loaded.phase, JobPhase::Error);
    let error = loaded.error.unwrap();
    assert_eq!(error.code, ErrorCode::InternalError);
    assert!(error.message.contains("interrupted by server restart"));
    assert!(loaded.finished_at.is_some());
    assert!(loaded.expires_at.is_some());
    // partial files stay on disk until the TTL sweep
    assert!(out_dir.join("input.mp3").exists());
}

#[tokio::test]
async fn reaper_removes_expired_records() {
    let env = setup("0");

    let out_dir = env.config.jobs_dir().join("job-expired");
    std::fs::create_dir_all(&out_dir).unwrap();
    let job = Job {
        id: "job-expired".into(),
        job_type: JobType::Asr,
        state: JobState::Succeeded,
        phase: JobPhase::Done,
        created_at: Utc::now() - chrono::Duration::hours(10),
        started_at: None,
        finished_at: Some(Utc::now() - chrono::Duration::hours(9)),
        expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        out_dir: out_dir.clone(),
        source: SourceKind::AudioPath,
        audio_path: None,
        cleanup_audio_on_finish: false,
        vad_max_single_segment_ms: None,
        vad_max_end_silence_ms: None,
        artifacts: Default::default(),
        error: None,
    };
    store::persist_job(&job).await.unwrap();
    env.manager.adopt_job(job).await;

    reaper::sweep(&env.manager).await.unwrap();
    assert!(env.manager.get_job("job-expired").await.is_none());
    assert!(!out_dir.exists());

    // idempotent on an already-swept directory
    reaper::sweep(&env.manager).await.unwrap();
}

#[tokio::test]
async fn startup_sweep_removes_stale_orphan_dirs() {
    let env = setup("0");

    let orphan = env.config.jobs_dir().join("job-orphan");
    std::fs::create_dir_all(&orphan).unwrap();
    std::fs::write(orphan.join("garbage.bin"), b"x").unwrap();

    // fresh orphan survives (mtime within TTL)
    reaper::startup_sweep(&env.manager).await.unwrap();
    assert!(orphan.exists());
}
