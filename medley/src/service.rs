//! Programmatic surface for submitting jobs and querying their state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PipelineConfig;
use crate::database::models::{
    AudioMode, FINAL_RESULT_KEY, FinalResult, JobStatus, MediaJobDbModel, StepState,
};
use crate::database::repositories::JobRepository;
use crate::pipeline::JobDispatcher;
use crate::{Error, Result};

/// A job submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub source: String,
    pub owner: String,
    pub audio_mode: AudioMode,
}

/// Acknowledgement returned for an accepted job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
}

/// Snapshot of one job as seen by callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub step_progress: BTreeMap<String, StepState>,
    /// Present only when the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_error: Option<String>,
    /// Present only when the job completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalResult>,
}

impl JobView {
    fn from_model(job: &MediaJobDbModel) -> Result<Self> {
        let status = job.job_status()?;
        let progress = job.progress_map()?;
        let result = if status == JobStatus::Completed {
            progress.final_result()?
        } else {
            None
        };
        let mut step_progress = progress.0;
        step_progress.remove(FINAL_RESULT_KEY);
        let job_error = if status == JobStatus::Failed {
            job.error.clone()
        } else {
            None
        };
        Ok(Self {
            job_id: job.id.clone(),
            status,
            step_progress,
            job_error,
            result,
        })
    }
}

/// Accepts jobs into the store and hands them to the dispatcher.
pub struct JobService {
    repo: Arc<dyn JobRepository>,
    dispatcher: Arc<JobDispatcher>,
    pipeline: PipelineConfig,
}

impl JobService {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        dispatcher: Arc<JobDispatcher>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            pipeline,
        }
    }

    /// Validate and persist a new job, then queue it for processing. The
    /// returned status is always `PENDING`.
    pub async fn create_job(&self, new_job: NewJob) -> Result<JobAccepted> {
        let source = new_job.source.trim();
        if source.is_empty() {
            return Err(Error::validation("source must not be empty"));
        }
        let owner = new_job.owner.trim();
        if owner.is_empty() {
            return Err(Error::validation("owner must not be empty"));
        }

        let job = MediaJobDbModel::new(
            source,
            owner,
            new_job.audio_mode,
            &self.pipeline.required_steps,
        )?;
        if !self.repo.create_job(&job).await? {
            return Err(Error::Other(format!("job id collision for {}", job.id)));
        }
        info!(job_id = %job.id, owner = %owner, mode = %job.audio_mode, "job accepted");
        self.dispatcher.submit(job.id.clone()).await;
        Ok(JobAccepted {
            job_id: job.id,
            status: JobStatus::Pending,
        })
    }

    /// Read the last durably recorded state of a job.
    pub async fn get_job(&self, job_id: &str) -> Result<JobView> {
        let job = self.repo.get_job(job_id).await?;
        JobView::from_model(&job)
    }
}
