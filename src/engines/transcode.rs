use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use super::{run_engine, stderr_tail};
use crate::config::Config;
use crate::jobs::types::JobError;

/// Convert any decodable input to single-channel 16-kHz 16-bit PCM WAV, the
/// only format the recognizer accepts.
pub async fn transcode_to_wav(
    config: &Config,
    input: &Path,
    out_wav: &Path,
) -> Result<(), JobError> {
    debug!("transcoding {} -> {}", input.display(), out_wav.display());

    let mut command = Command::new(&config.ffmpeg_bin);
    command
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg("16000")
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg(out_wav);

    let output = run_engine(command).await?;
    if !output.status.success() {
        return Err(JobError::bad_audio("audio transcode failed")
            .with_details(stderr_tail(&output.stderr)));
    }

    info!("transcoded {} to 16k mono wav", input.display());
    Ok(())
}
