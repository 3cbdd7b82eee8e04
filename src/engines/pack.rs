use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{run_engine, stderr_tail};
use crate::config::Config;
use crate::jobs::types::JobError;

#[derive(Debug, Clone)]
pub struct PackEntry {
    pub source: PathBuf,
    pub archive_name: String,
}

impl PackEntry {
    pub fn new(source: impl Into<PathBuf>, archive_name: impl Into<String>) -> Self {
        Self { source: source.into(), archive_name: archive_name.into() }
    }
}

/// Create a deflated archive at `zip_path` containing exactly the given
/// entries under their stated archive names.
///
/// The zip tool stores entries under their on-disk names, so the entries are
/// first staged into a scratch directory under the archive's parent and the
/// tool is invoked with junked paths.
pub async fn pack_zip(
    config: &Config,
    zip_path: &Path,
    entries: &[PackEntry],
) -> Result<(), JobError> {
    let parent = zip_path
        .parent()
        .ok_or_else(|| JobError::internal(format!("{} has no parent", zip_path.display())))?;
    let stage = parent.join(format!(".pack-{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&stage)
        .await
        .map_err(|e| JobError::internal(format!("failed to create staging dir: {e}")))?;

    let result = pack_from_stage(config, zip_path, entries, &stage).await;
    if let Err(e) = tokio::fs::remove_dir_all(&stage).await {
        warn!("failed to remove staging dir {}: {e}", stage.display());
    }
    result
}

async fn pack_from_stage(
    config: &Config,
    zip_path: &Path,
    entries: &[PackEntry],
    stage: &Path,
) -> Result<(), JobError> {
    let mut staged = Vec::with_capacity(entries.len());
    for entry in entries {
        let dest = stage.join(&entry.archive_name);
        tokio::fs::copy(&entry.source, &dest).await.map_err(|e| {
            JobError::internal(format!("failed to stage {}: {e}", entry.source.display()))
        })?;
        staged.push(dest);
    }

    // the zip tool appends to an existing archive; always start fresh
    let _ = tokio::fs::remove_file(zip_path).await;

    debug!("packing {} entries into {}", entries.len(), zip_path.display());
    let mut command = Command::new(&config.zip_bin);
    command.arg("-q").arg("-j").arg(zip_path);
    for path in &staged {
        command.arg(path);
    }

    let output = run_engine(command).await?;
    if !output.status.success() {
        return Err(
            JobError::internal("archive packer failed").with_details(stderr_tail(&output.stderr))
        );
    }

    info!("packed {}", zip_path.display());
    Ok(())
}
