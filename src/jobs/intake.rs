use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Config;
use crate::jobs::types::{InputDescriptor, JobError, SourceKind};
use crate::utils::http;

/// Result of turning an input descriptor into a readable file. `owned` means
/// the core controls the file's lifetime and must delete it at the end.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub audio_path: PathBuf,
    pub source: SourceKind,
    pub owned: bool,
}

/// Materialize one input under `dest_dir` as `<stem>.<ext>`.
///
/// Uploads are moved out of the spool, URLs are downloaded to disk, and
/// local paths are referenced in place (never owned, never deleted).
pub async fn materialize(
    config: &Config,
    input: &InputDescriptor,
    dest_dir: &Path,
    stem: &str,
) -> Result<Materialized, JobError> {
    match input {
        InputDescriptor::Upload { spool_path, file_name } => {
            let ext = file_name
                .as_deref()
                .and_then(http::extension_from_name)
                .or_else(|| {
                    spool_path.file_name().and_then(|n| http::extension_from_name(n.to_str()?))
                })
                .unwrap_or_else(|| "bin".to_string());
            let dest = dest_dir.join(format!("{stem}.{ext}"));
            move_file(spool_path, &dest).await?;
            info!("materialized upload at {}", dest.display());
            Ok(Materialized { audio_path: dest, source: SourceKind::Upload, owned: true })
        }
        InputDescriptor::AudioUrl { url } => {
            let ext = http::extension_from_url(url).unwrap_or_else(|| "bin".to_string());
            let dest = dest_dir.join(format!("{stem}.{ext}"));
            http::download_audio(url, &dest, config.max_download_bytes).await?;
            Ok(Materialized { audio_path: dest, source: SourceKind::AudioUrl, owned: true })
        }
        InputDescriptor::AudioPath { path } => {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|_| JobError::bad_request(format!("audio file not found: {}", path.display())))?;
            if !meta.is_file() {
                return Err(JobError::bad_request(format!(
                    "audioPath is not a regular file: {}",
                    path.display()
                )));
            }
            Ok(Materialized {
                audio_path: path.clone(),
                source: SourceKind::AudioPath,
                owned: false,
            })
        }
    }
}

/// Rename `src` to `dest`, falling back to copy+delete across devices.
pub async fn move_file(src: &Path, dest: &Path) -> Result<(), JobError> {
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest)
        .await
        .map_err(|e| JobError::internal(format!("failed to move {}: {e}", src.display())))?;
    if let Err(e) = tokio::fs::remove_file(src).await {
        warn!("failed to remove {} after copy: {e}", src.display());
    }
    Ok(())
}

/// Delete an owned input at terminal transition. Unowned inputs are never
/// touched. Best effort; a leftover file is reclaimed by the TTL sweep.
pub async fn release_input(audio_path: Option<&Path>, owned: bool) {
    if !owned {
        return;
    }
    let Some(path) = audio_path else { return };
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("released owned input {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to release owned input {}: {e}", path.display()),
    }
}
