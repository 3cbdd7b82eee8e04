use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Artifact keys and their stable file names inside a job/item directory.
pub const ART_SRT: &str = "srt";
pub const ART_VOCALS: &str = "vocals";
pub const ART_NO_VOCALS: &str = "no_vocals";
pub const ART_DEMUCS_ZIP: &str = "demucs_zip";
pub const ART_RESULT_ZIP: &str = "result_zip";

pub const SRT_FILE: &str = "output.srt";
pub const VOCALS_FILE: &str = "vocals.mp3";
pub const NO_VOCALS_FILE: &str = "no_vocals.mp3";
pub const DEMUCS_ZIP_FILE: &str = "demucs.zip";
pub const RESULT_ZIP_FILE: &str = "result.zip";

pub fn artifact_file_name(key: &str) -> Option<&'static str> {
    match key {
        ART_SRT => Some(SRT_FILE),
        ART_VOCALS => Some(VOCALS_FILE),
        ART_NO_VOCALS => Some(NO_VOCALS_FILE),
        ART_DEMUCS_ZIP => Some(DEMUCS_ZIP_FILE),
        ART_RESULT_ZIP => Some(RESULT_ZIP_FILE),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Asr,
    Demucs,
    AsrDemucs,
}

impl JobType {
    /// Parse a client-supplied type string. Historical aliases for the
    /// combined pipeline are accepted; anything else is a `bad_request`.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        match raw {
            "asr" => Ok(Self::Asr),
            "demucs" => Ok(Self::Demucs),
            "asr-demucs" | "demucs-asr" | "demucsasr" | "asr+demucs" | "" => Ok(Self::AsrDemucs),
            other => Err(JobError::bad_request(format!("unknown job type: {other}"))),
        }
    }

    pub fn wants_asr(&self) -> bool {
        matches!(self, Self::Asr | Self::AsrDemucs)
    }

    pub fn wants_demucs(&self) -> bool {
        matches!(self, Self::Demucs | Self::AsrDemucs)
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Asr => "asr",
            Self::Demucs => "demucs",
            Self::AsrDemucs => "asr-demucs",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Fine-grained pipeline progress within a `running` state. Shared by jobs
/// and batch items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    AsrConvert,
    Asr,
    Demucs,
    ZipDemucs,
    ZipResult,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Upload,
    AudioPath,
    AudioUrl,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    BadAudio,
    Unauthorized,
    Forbidden,
    NotFound,
    EngineError,
    InternalError,
}

/// Error recorded on a terminal job/batch item and surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<String>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn bad_audio(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadAudio, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EngineError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

/// A named output file produced by a stage. `ready` is authoritative only
/// after reconciliation against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub phase: JobPhase,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub out_dir: PathBuf,
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub audio_path: Option<PathBuf>,
    pub cleanup_audio_on_finish: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vad_max_single_segment_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vad_max_end_silence_ms: Option<u32>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JobError>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Validate,
    Asr,
    Demucs,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTasks {
    pub asr: bool,
    pub demucs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    /// Only `stage-first` is supported.
    pub policy: String,
    pub tasks: BatchTasks,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vad_max_single_segment_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vad_max_end_silence_ms: Option<u32>,
}

pub const POLICY_STAGE_FIRST: &str = "stage-first";

/// How a client described one input. The transport layer spools uploads to
/// disk before handing the descriptor over; the core owns materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InputDescriptor {
    #[serde(rename_all = "camelCase")]
    Upload {
        spool_path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        file_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AudioPath { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    AudioUrl { url: String },
}

impl InputDescriptor {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Upload { .. } => SourceKind::Upload,
            Self::AudioPath { .. } => SourceKind::AudioPath,
            Self::AudioUrl { .. } => SourceKind::AudioUrl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub idx: usize,
    pub input: InputDescriptor,
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub audio_path: Option<PathBuf>,
    pub owned_input: bool,
    pub state: ItemState,
    pub phase: JobPhase,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub state: BatchState,
    pub phase: BatchPhase,
    pub options: BatchOptions,
    pub items: Vec<BatchItem>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub out_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl Batch {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts { total: self.items.len(), ..Default::default() };
        for item in &self.items {
            match item.state {
                ItemState::Succeeded => counts.succeeded += 1,
                ItemState::Failed => counts.failed += 1,
                ItemState::Canceled => counts.canceled += 1,
                _ => {}
            }
        }
        counts
    }
}

/// VAD tuning values must be positive integers.
pub fn validate_vad_param(name: &str, value: Option<i64>) -> Result<Option<u32>, JobError> {
    match value {
        None => Ok(None),
        Some(v) if v > 0 && v <= u32::MAX as i64 => Ok(Some(v as u32)),
        Some(v) => Err(JobError::bad_request(format!("{name} must be a positive integer, got {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_aliases_map_to_combined() {
        for alias in ["asr-demucs", "demucs-asr", "demucsasr", "asr+demucs", ""] {
            assert_eq!(JobType::parse(alias).unwrap(), JobType::AsrDemucs, "alias {alias:?}");
        }
        assert_eq!(JobType::parse("asr").unwrap(), JobType::Asr);
        assert_eq!(JobType::parse("demucs").unwrap(), JobType::Demucs);
    }

    #[test]
    fn unknown_job_type_is_bad_request() {
        let err = JobType::parse("transcribe").unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn job_type_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&JobType::AsrDemucs).unwrap(), "\"asr-demucs\"");
        assert_eq!(serde_json::to_string(&JobPhase::AsrConvert).unwrap(), "\"asr_convert\"");
        assert_eq!(serde_json::to_string(&ErrorCode::BadAudio).unwrap(), "\"bad_audio\"");
    }

    #[test]
    fn vad_params_must_be_positive() {
        assert_eq!(validate_vad_param("vadMaxSingleSegmentMs", Some(8000)).unwrap(), Some(8000));
        assert_eq!(validate_vad_param("vadMaxSingleSegmentMs", None).unwrap(), None);
        assert!(validate_vad_param("vadMaxSingleSegmentMs", Some(0)).is_err());
        assert!(validate_vad_param("vadMaxEndSilenceMs", Some(-50)).is_err());
    }

    #[test]
    fn input_descriptor_uses_kind_tag() {
        let desc = InputDescriptor::AudioUrl { url: "http://example.com/a.mp3".into() };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["kind"], "audioUrl");

        let parsed: InputDescriptor =
            serde_json::from_value(serde_json::json!({"kind": "audioPath", "path": "/tmp/a.wav"}))
                .unwrap();
        assert!(matches!(parsed, InputDescriptor::AudioPath { .. }));
    }

    #[test]
    fn batch_counts_tally_item_states() {
        let mut batch = Batch {
            id: "batch-x".into(),
            state: BatchState::Running,
            phase: BatchPhase::Asr,
            options: BatchOptions {
                policy: POLICY_STAGE_FIRST.into(),
                tasks: BatchTasks { asr: true, demucs: false },
                vad_max_single_segment_ms: None,
                vad_max_end_silence_ms: None,
            },
            items: Vec::new(),
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
            out_dir: PathBuf::from("/tmp/batches/batch-x"),
            error: None,
        };
        for (idx, state) in
            [ItemState::Succeeded, ItemState::Failed, ItemState::Canceled, ItemState::Queued]
                .into_iter()
                .enumerate()
        {
            batch.items.push(BatchItem {
                idx,
                input: InputDescriptor::AudioPath { path: PathBuf::from("/tmp/a.wav") },
                source: SourceKind::AudioPath,
                audio_path: Some(PathBuf::from("/tmp/a.wav")),
                owned_input: false,
                state,
                phase: JobPhase::Queued,
                started_at: None,
                finished_at: None,
                artifacts: BTreeMap::new(),
                error: None,
            });
        }
        let counts = batch.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.canceled, 1);
    }
}
