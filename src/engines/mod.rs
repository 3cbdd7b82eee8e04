use std::process::Stdio;

use tokio::process::Command;

use crate::jobs::types::JobError;

pub mod pack;
pub mod separate;
pub mod transcode;

pub use pack::{pack_zip, PackEntry};
pub use separate::{separate_two_stems, StemPaths};
pub use transcode::transcode_to_wav;

/// Most stderr we are willing to carry into an error record.
const STDERR_TAIL_MAX: usize = 32 * 1024;

/// Lossy tail of an engine's stderr, capped at 32 KB.
pub(crate) fn stderr_tail(raw: &[u8]) -> String {
    let start = raw.len().saturating_sub(STDERR_TAIL_MAX);
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

/// Run a one-shot engine to completion, capturing stderr. stdout is
/// discarded; the adapters only care about exit status and on-disk output.
pub(crate) async fn run_engine(mut command: Command) -> Result<std::process::Output, JobError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| JobError::internal(format!("failed to launch engine: {e}")))
}
