use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime settings, resolved once at startup from the environment.
///
/// Engine binaries are external tools; the orchestrator only needs to know
/// where to find them and which knobs to pass through.
#[derive(Debug, Clone)]
pub struct Config {
    pub tmp_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Static bearer token; `None` disables authentication.
    pub api_token: Option<String>,
    pub job_ttl: Duration,
    pub demucs_mp3_bitrate: u32,
    pub demucs_jobs: u32,
    pub ffmpeg_bin: PathBuf,
    pub demucs_bin: PathBuf,
    pub zip_bin: PathBuf,
    pub asr_python_bin: PathBuf,
    pub asr_worker_script: PathBuf,
    pub asr_idle_seconds: u64,
    /// Cap on `audioUrl` downloads; `None` means unbounded.
    pub max_download_bytes: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let tmp_dir = PathBuf::from(env_or("TMP_DIR", "./stemscribe_data"));
        let bind_addr = env_or("BIND_ADDR", "127.0.0.1:7200")
            .parse()
            .context("invalid BIND_ADDR")?;

        Ok(Self {
            tmp_dir,
            bind_addr,
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            job_ttl: Duration::from_secs(parse_env("JOB_TTL_SECONDS", 21600)?),
            demucs_mp3_bitrate: parse_env("DEMUCS_MP3_BITRATE", 256)?,
            demucs_jobs: parse_env("DEMUCS_JOBS", 2)?,
            ffmpeg_bin: PathBuf::from(env_or("FFMPEG_BIN", "ffmpeg")),
            demucs_bin: PathBuf::from(env_or("DEMUCS_BIN", "demucs")),
            zip_bin: PathBuf::from(env_or("ZIP_BIN", "zip")),
            asr_python_bin: PathBuf::from(env_or("ASR_PYTHON_BIN", "python3")),
            asr_worker_script: PathBuf::from(env_or(
                "ASR_WORKER_SCRIPT",
                "./python/funasr_worker.py",
            )),
            asr_idle_seconds: parse_env("ASR_IDLE_SECONDS", 300)?,
            max_download_bytes: match env::var("MAX_DOWNLOAD_BYTES") {
                Ok(raw) => Some(raw.parse().context("invalid MAX_DOWNLOAD_BYTES")?),
                Err(_) => None,
            },
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.tmp_dir.join("uploads")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.tmp_dir.join("jobs-v2")
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.tmp_dir.join("batches")
    }

    /// Create the on-disk layout the orchestrator owns.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.uploads_dir(), self.jobs_dir(), self.batches_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw.parse().with_context(|| format!("invalid {key}")),
        _ => Ok(default),
    }
}
