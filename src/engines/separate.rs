use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use super::{run_engine, stderr_tail};
use crate::config::Config;
use crate::jobs::types::JobError;

#[derive(Debug, Clone)]
pub struct StemPaths {
    pub vocals: PathBuf,
    pub no_vocals: PathBuf,
}

/// Run the two-stem source separator, writing MP3 stems somewhere under
/// `out_dir`. The separator chooses its own subdirectory layout, so the
/// stems are located afterwards by filename suffix.
pub async fn separate_two_stems(
    config: &Config,
    input: &Path,
    out_dir: &Path,
) -> Result<StemPaths, JobError> {
    debug!("separating {} into {}", input.display(), out_dir.display());

    let mut command = Command::new(&config.demucs_bin);
    command
        .arg("--two-stems")
        .arg("vocals")
        .arg("--mp3")
        .arg("--mp3-bitrate")
        .arg(config.demucs_mp3_bitrate.to_string())
        .arg("-j")
        .arg(config.demucs_jobs.to_string())
        .arg("-o")
        .arg(out_dir)
        .arg(input);

    let output = run_engine(command).await?;
    if !output.status.success() {
        return Err(JobError::bad_audio("source separation failed")
            .with_details(stderr_tail(&output.stderr)));
    }

    let stems = locate_stems(out_dir)
        .ok_or_else(|| JobError::engine("separator finished but stems are missing"))?;
    info!("separated {} into vocals/no_vocals", input.display());
    Ok(stems)
}

/// Find `vocals.mp3` and `no_vocals.mp3` anywhere under `root`.
pub(crate) fn locate_stems(root: &Path) -> Option<StemPaths> {
    let mut vocals = None;
    let mut no_vocals = None;
    for file in walk_files(root) {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else { continue };
        if name.ends_with("no_vocals.mp3") {
            no_vocals.get_or_insert(file);
        } else if name.ends_with("vocals.mp3") {
            vocals.get_or_insert(file);
        }
    }
    Some(StemPaths { vocals: vocals?, no_vocals: no_vocals? })
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
