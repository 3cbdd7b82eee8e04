use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use stemscribe::asr::AsrWorker;
use stemscribe::config::Config;
use stemscribe::jobs::{reaper, JobManager};
use stemscribe::queue::SerialQueue;
use stemscribe::utils::logger;
use stemscribe::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logger::init("./logs".to_string())?;

    let config = Arc::new(Config::from_env()?);
    config.ensure_layout()?;

    info!("Starting stemscribe orchestrator...");

    let queue = SerialQueue::new();
    let asr = AsrWorker::new(config.clone());
    let manager = JobManager::new(config.clone(), queue, asr);

    // interrupted work is failed, expired work is removed
    info!("Sweeping persistence directories...");
    reaper::startup_sweep(&manager).await?;
    reaper::spawn(manager.clone());

    let ctx = Arc::new(AppContext { config: config.clone(), manager });

    let addr = config.bind_addr;
    info!("Starting HTTP server at http://{}", addr);
    match stemscribe::web::start_server(ctx, addr).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
