use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::jobs::types::JobError;

/// Download a remote audio file, streaming the body to `dest`.
///
/// Returns the number of bytes written. An over-limit download is aborted,
/// the partial file removed, and the request rejected as `bad_request`.
pub async fn download_audio(
    url: &str,
    dest: &Path,
    max_bytes: Option<u64>,
) -> Result<u64, JobError> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| JobError::bad_request(format!("failed to download audio: {e}")))?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| JobError::internal(format!("failed to create {}: {e}", dest.display())))?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(JobError::bad_request(format!("download interrupted: {e}")));
            }
        };
        written += chunk.len() as u64;
        if let Some(max) = max_bytes {
            if written > max {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(JobError::bad_request(format!(
                    "download exceeds the {max} byte limit"
                )));
            }
        }
        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(JobError::internal(format!("failed to write download: {e}")));
        }
    }
    file.flush()
        .await
        .map_err(|e| JobError::internal(format!("failed to flush download: {e}")))?;

    info!("downloaded {url} to {} ({written} bytes)", dest.display());
    Ok(written)
}

/// Guess a file extension from the final path segment of a URL.
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.rsplit('/').next()?;
    extension_from_name(segment)
}

/// Sanitized extension from a file name: short, lowercase, alphanumeric.
pub fn extension_from_name(name: &str) -> Option<String> {
    let ext = PathBuf::from(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}
