pub mod asr;
pub mod config;
pub mod engines;
pub mod jobs;
pub mod queue;
pub mod store;
pub mod utils;
pub mod web;

use std::sync::Arc;

use config::Config;
use jobs::JobManager;

pub struct AppContext {
    pub config: Arc<Config>,
    pub manager: Arc<JobManager>,
}
