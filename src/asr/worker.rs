use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use super::{AsrRequest, AsrResult, Recognizer, WorkerEvent};
use crate::config::Config;
use crate::jobs::types::JobError;

/// stderr lines from the worker are diagnostics; cap what we log per line.
const STDERR_LINE_MAX: usize = 2 * 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<AsrResult>>>>;

/// Supervisor for the single long-lived recognizer subprocess.
///
/// The recognizer preloads heavy models, so it is spawned lazily on the
/// first request and multiplexed across requests with line-delimited JSON:
/// requests carry a monotonically increasing `id`, responses are matched
/// back by that `id`. The worker exits on its own after `idleSeconds` of
/// inactivity; that exit is benign and the next request re-spawns it.
pub struct AsrWorker {
    config: Arc<Config>,
    next_id: AtomicU64,
    handle: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
    stdin: ChildStdin,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    pid: u32,
}

enum Attempt {
    Done(AsrResult),
    /// The worker died before answering; the caller may respawn once.
    Died,
}

impl AsrWorker {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self { config, next_id: AtomicU64::new(1), handle: Mutex::new(None) })
    }

    async fn attempt(&self, request: AsrRequest) -> Result<Attempt, JobError> {
        let mut guard = self.handle.lock().await;

        let needs_spawn = match guard.as_ref() {
            Some(handle) => !handle.alive.load(Ordering::SeqCst),
            None => true,
        };
        if needs_spawn {
            *guard = Some(self.spawn_worker().await?);
        }
        let handle = guard.as_mut().expect("worker handle just ensured");

        let (tx, rx) = oneshot::channel();
        handle.pending.lock().await.insert(request.id, tx);

        let mut line = serde_json::to_string(&request)
            .map_err(|e| JobError::internal(format!("failed to encode asr request: {e}")))?;
        line.push('\n');
        if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
            warn!("failed to write to asr worker: {e}");
            handle.pending.lock().await.remove(&request.id);
            handle.alive.store(false, Ordering::SeqCst);
            return Ok(Attempt::Died);
        }
        drop(guard);

        // the reader task resolves this; dropped sender means the worker died
        match rx.await {
            Ok(result) => Ok(Attempt::Done(result)),
            Err(_) => Ok(Attempt::Died),
        }
    }

    /// Spawn the recognizer and wait for its `ready` handshake.
    async fn spawn_worker(&self) -> Result<WorkerHandle, JobError> {
        let mut child = Command::new(&self.config.asr_python_bin)
            .arg(&self.config.asr_worker_script)
            .arg("--idle-seconds")
            .arg(self.config.asr_idle_seconds.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JobError::internal(format!("failed to spawn asr worker: {e}")))?;

        let pid = child.id().unwrap_or_default();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobError::internal("asr worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::internal("asr worker stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::internal("asr worker stderr not captured"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut line = line;
                line.truncate(STDERR_LINE_MAX);
                debug!("asr worker stderr: {line}");
            }
        });

        {
            let pending = pending.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut child = child;
                let mut ready_tx = Some(ready_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<WorkerEvent>(&line) {
                        Ok(WorkerEvent::Ready { pid, device, ncpu, idle_seconds }) => {
                            info!(
                                "asr worker ready (pid={pid:?} device={device:?} ncpu={ncpu:?} \
                                 idleSeconds={idle_seconds:?})"
                            );
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                        Ok(WorkerEvent::Result(result)) => {
                            let waiter = pending.lock().await.remove(&result.id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => debug!("discarding orphan asr response id={}", result.id),
                            }
                        }
                        Err(e) => warn!("unparseable asr worker line: {e}"),
                    }
                }

                // EOF: the worker exited. Dropping the pending senders fails
                // every in-flight request; an idle exit has none to fail.
                alive.store(false, Ordering::SeqCst);
                let abandoned = {
                    let mut pending = pending.lock().await;
                    let n = pending.len();
                    pending.clear();
                    n
                };
                let status = child.wait().await;
                if abandoned == 0 {
                    info!("asr worker exited (status {status:?}), will respawn on demand");
                } else {
                    error!(
                        "asr worker exited (status {status:?}) with {abandoned} request(s) in flight"
                    );
                }
            });
        }

        // `ready` is the sole readiness signal; an early exit drops the
        // sender and the spawn counts as a death the caller may retry.
        if ready_rx.await.is_err() {
            return Err(JobError::engine("asr worker exited before reporting ready"));
        }

        info!("asr worker spawned (pid {pid})");
        Ok(WorkerHandle { stdin, pending, alive, pid })
    }

    /// Worker pid, if one is currently believed alive. Diagnostic only.
    pub async fn current_pid(&self) -> Option<u32> {
        let guard = self.handle.lock().await;
        guard
            .as_ref()
            .filter(|h| h.alive.load(Ordering::SeqCst))
            .map(|h| h.pid)
    }
}

#[async_trait]
impl Recognizer for AsrWorker {
    /// Run one recognition. On observing worker death the request is retried
    /// exactly once against a fresh worker; a second failure is surfaced.
    async fn recognize(
        &self,
        audio_path: &Path,
        out_dir: &Path,
        vad_max_single_segment_ms: Option<u32>,
        vad_max_end_silence_ms: Option<u32>,
    ) -> Result<PathBuf, JobError> {
        let request = |id| AsrRequest {
            kind: "asr",
            id,
            audio_path: audio_path.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            vad_max_single_segment_ms,
            vad_max_end_silence_ms,
        };

        match self.attempt(request(self.next_id.fetch_add(1, Ordering::SeqCst))).await? {
            Attempt::Done(result) => finish(result),
            Attempt::Died => {
                warn!("asr worker died mid-request, respawning for one retry");
                match self.attempt(request(self.next_id.fetch_add(1, Ordering::SeqCst))).await? {
                    Attempt::Done(result) => finish(result),
                    Attempt::Died => Err(JobError::engine("asr worker crashed twice in a row")),
                }
            }
        }
    }
}

fn finish(result: AsrResult) -> Result<PathBuf, JobError> {
    if result.ok {
        result
            .srt_path
            .ok_or_else(|| JobError::engine("asr worker reported ok without an srt path"))
    } else {
        let mut err =
            JobError::engine(result.error.unwrap_or_else(|| "asr worker failed".to_string()));
        if let Some(traceback) = result.traceback {
            err = err.with_details(traceback);
        }
        Err(err)
    }
}
