use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::types::JobError;

mod worker;

pub use worker::AsrWorker;

/// The seam the pipeline engines speak to: hand over a 16-kHz mono WAV, get
/// back the path of the SRT the recognizer wrote.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(
        &self,
        audio_path: &Path,
        out_dir: &Path,
        vad_max_single_segment_ms: Option<u32>,
        vad_max_end_silence_ms: Option<u32>,
    ) -> Result<PathBuf, JobError>;
}

/// One recognition request, written to the worker as a single JSON line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: u64,
    pub audio_path: PathBuf,
    pub out_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_max_single_segment_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_max_end_silence_ms: Option<u32>,
}

/// Everything the worker may emit on stdout, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready {
        pid: Option<u32>,
        device: Option<String>,
        ncpu: Option<u32>,
        idle_seconds: Option<u64>,
    },
    #[serde(rename = "result")]
    Result(AsrResult),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrResult {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub srt_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}
