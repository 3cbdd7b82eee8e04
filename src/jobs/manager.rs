use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::asr::Recognizer;
use crate::config::Config;
use crate::jobs::types::*;
use crate::jobs::{batch, intake, runner};
use crate::queue::{QueueCounts, SerialQueue};
use crate::store;

/// Parameters for a new single-item job, already decoded by the transport.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub input: InputDescriptor,
    pub vad_max_single_segment_ms: Option<i64>,
    pub vad_max_end_silence_ms: Option<i64>,
}

/// Parameters for a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub tasks: BatchTasks,
    pub policy: Option<String>,
    pub items: Vec<InputDescriptor>,
    pub vad_max_single_segment_ms: Option<i64>,
    pub vad_max_end_silence_ms: Option<i64>,
}

/// Owner of the in-memory job/batch tables and the entry point for creating
/// work. Records are mutated only by the engine task that owns them; readers
/// get value snapshots. The filesystem is the crash-consistent source of
/// truth and these tables are a cache over it.
pub struct JobManager {
    config: Arc<Config>,
    queue: Arc<SerialQueue>,
    asr: Arc<dyn Recognizer>,
    jobs: Mutex<HashMap<String, Job>>,
    batches: Mutex<HashMap<String, Batch>>,
}

impl JobManager {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<SerialQueue>,
        asr: Arc<dyn Recognizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            asr,
            jobs: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn asr(&self) -> &Arc<dyn Recognizer> {
        &self.asr
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.queue.counts()
    }

    /// Create a job record, materialize its input, persist it and enqueue it
    /// on the engine queue.
    pub async fn create_job(self: &Arc<Self>, new: NewJob) -> Result<Job, JobError> {
        let job_type = JobType::parse(&new.job_type)?;
        let vad_single =
            validate_vad_param("vadMaxSingleSegmentMs", new.vad_max_single_segment_ms)?;
        let vad_silence = validate_vad_param("vadMaxEndSilenceMs", new.vad_max_end_silence_ms)?;

        let id = format!("job-{}", Uuid::new_v4());
        let out_dir = self.config.jobs_dir().join(&id);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| JobError::internal(format!("failed to create job dir: {e}")))?;

        let materialized =
            match intake::materialize(&self.config, &new.input, &out_dir, "input").await {
                Ok(m) => m,
                Err(e) => {
                    let _ = tokio::fs::remove_dir_all(&out_dir).await;
                    return Err(e);
                }
            };

        let job = Job {
            id: id.clone(),
            job_type,
            state: JobState::Queued,
            phase: JobPhase::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
            out_dir,
            source: materialized.source,
            audio_path: Some(materialized.audio_path),
            cleanup_audio_on_finish: materialized.owned,
            vad_max_single_segment_ms: vad_single,
            vad_max_end_silence_ms: vad_silence,
            artifacts: Default::default(),
            error: None,
        };
        store::persist_job(&job).await?;
        self.jobs.lock().await.insert(id.clone(), job.clone());
        info!("created job {id} ({job_type})");

        let manager = self.clone();
        let job_id = id.clone();
        let _detached = self.queue.submit(async move {
            runner::run_job(manager, job_id).await;
        });

        Ok(job)
    }

    /// Create a batch of 1..10 items. Inputs are materialized up front; an
    /// item whose input cannot be materialized starts out failed and the
    /// rest of the batch proceeds without it.
    pub async fn create_batch(self: &Arc<Self>, new: NewBatch) -> Result<Batch, JobError> {
        if new.items.is_empty() || new.items.len() > 10 {
            return Err(JobError::bad_request(format!(
                "items must contain between 1 and 10 entries, got {}",
                new.items.len()
            )));
        }
        if !new.tasks.asr && !new.tasks.demucs {
            return Err(JobError::bad_request("at least one of tasks.asr/tasks.demucs is required"));
        }
        let policy = new.policy.unwrap_or_else(|| POLICY_STAGE_FIRST.to_string());
        if policy != POLICY_STAGE_FIRST {
            return Err(JobError::bad_request(format!("unsupported batch policy: {policy}")));
        }
        let vad_single =
            validate_vad_param("vadMaxSingleSegmentMs", new.vad_max_single_segment_ms)?;
        let vad_silence = validate_vad_param("vadMaxEndSilenceMs", new.vad_max_end_silence_ms)?;

        let id = format!("batch-{}", Uuid::new_v4());
        let out_dir = self.config.batches_dir().join(&id);
        let inputs_dir = out_dir.join("inputs");
        tokio::fs::create_dir_all(&inputs_dir)
            .await
            .map_err(|e| JobError::internal(format!("failed to create batch dir: {e}")))?;

        let mut items = Vec::with_capacity(new.items.len());
        for (idx, input) in new.items.into_iter().enumerate() {
            let mut item = BatchItem {
                idx,
                source: input.source_kind(),
                input,
                audio_path: None,
                owned_input: false,
                state: ItemState::Queued,
                phase: JobPhase::Queued,
                started_at: None,
                finished_at: None,
                artifacts: Default::default(),
                error: None,
            };
            match intake::materialize(&self.config, &item.input, &inputs_dir, &idx.to_string())
                .await
            {
                Ok(materialized) => {
                    item.audio_path = Some(materialized.audio_path);
                    item.owned_input = materialized.owned;
                }
                Err(e) => {
                    error!("batch {id} item {idx}: input materialization failed: {e}");
                    item.state = ItemState::Failed;
                    item.phase = JobPhase::Error;
                    item.finished_at = Some(Utc::now());
                    item.error = Some(e);
                }
            }
            items.push(item);
        }

        let batch = Batch {
            id: id.clone(),
            state: BatchState::Queued,
            phase: BatchPhase::Validate,
            options: BatchOptions {
                policy,
                tasks: new.tasks,
                vad_max_single_segment_ms: vad_single,
                vad_max_end_silence_ms: vad_silence,
            },
            items,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
            out_dir,
            error: None,
        };
        store::persist_batch(&batch).await?;
        self.batches.lock().await.insert(id.clone(), batch.clone());
        info!("created batch {id} with {} item(s)", batch.items.len());

        let manager = self.clone();
        let batch_id = id.clone();
        let _detached = self.queue.submit(async move {
            batch::run_batch(manager, batch_id).await;
        });

        Ok(batch)
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.get(id).cloned()
    }

    pub async fn get_batch(&self, id: &str) -> Option<Batch> {
        self.batches.lock().await.get(id).cloned()
    }

    /// Request cooperative cancellation. A terminal batch is left untouched
    /// and returned as-is.
    pub async fn cancel_batch(&self, id: &str) -> Result<Batch, JobError> {
        let snapshot = {
            let mut batches = self.batches.lock().await;
            let batch = batches
                .get_mut(id)
                .ok_or_else(|| JobError::not_found(format!("batch not found: {id}")))?;
            if batch.is_terminal() || batch.cancel_requested {
                return Ok(batch.clone());
            }
            batch.cancel_requested = true;
            batch.clone()
        };
        info!("cancel requested for batch {id}");
        if let Err(e) = store::persist_batch(&snapshot).await {
            error!("failed to persist cancel flag for {id}: {e}");
        }
        Ok(snapshot)
    }

    /// Apply a mutation to a job, persist the result, and return a snapshot.
    /// Used only by the engine task that owns the job.
    pub async fn update_job<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(id)?;
            mutate(job);
            job.clone()
        };
        if let Err(e) = store::persist_job(&snapshot).await {
            error!("failed to persist job {id}: {e}");
        }
        Some(snapshot)
    }

    /// Batch counterpart of [`Self::update_job`].
    pub async fn update_batch<F>(&self, id: &str, mutate: F) -> Option<Batch>
    where
        F: FnOnce(&mut Batch),
    {
        let snapshot = {
            let mut batches = self.batches.lock().await;
            let batch = batches.get_mut(id)?;
            mutate(batch);
            batch.clone()
        };
        if let Err(e) = store::persist_batch(&snapshot).await {
            error!("failed to persist batch {id}: {e}");
        }
        Some(snapshot)
    }

    /// Insert a record loaded from disk (startup sweep).
    pub async fn adopt_job(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    pub async fn adopt_batch(&self, batch: Batch) {
        self.batches.lock().await.insert(batch.id.clone(), batch);
    }

    /// Terminal records past their expiry, for the reaper.
    pub async fn expired_jobs(&self) -> Vec<Job> {
        let now = Utc::now();
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| j.is_terminal() && j.expires_at.is_some_and(|t| t <= now))
            .cloned()
            .collect()
    }

    pub async fn expired_batches(&self) -> Vec<Batch> {
        let now = Utc::now();
        self.batches
            .lock()
            .await
            .values()
            .filter(|b| b.is_terminal() && b.expires_at.is_some_and(|t| t <= now))
            .cloned()
            .collect()
    }

    pub async fn drop_job(&self, id: &str) {
        self.jobs.lock().await.remove(id);
    }

    pub async fn drop_batch(&self, id: &str) {
        self.batches.lock().await.remove(id);
    }
}
