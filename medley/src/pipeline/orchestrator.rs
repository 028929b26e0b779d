//! Drives one delivery of one job from source to terminal state.
//!
//! The two branches of the pipeline run concurrently:
//!
//! ```text
//!           +-> scene_cut
//! source ---|
//!           +-> audio_extract -> text_convert
//! ```
//!
//! Every branch records its own step transitions, so a crash mid-run leaves
//! an accurate partial trail behind. The orchestrator only ever writes the
//! whole-job status and the final result entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engines::{
    DEFAULT_SCENE_THRESHOLD, EngineError, Scene, SceneDetector, SceneRequest, SeparatedAudio,
    SeparationRequest, SpeechTranscriber, Transcription, TranscriptionRequest, VocalSeparator,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactManager;
use crate::config::PipelineConfig;
use crate::database::models::{AudioMode, FinalResult, JobStatus, MediaJobDbModel, StepKind, StepStatus};
use crate::database::repositories::JobRepository;
use crate::pipeline::SourceMaterializer;
use crate::{Error, Result};

/// Error text recorded against a step that never ran because the step it
/// depends on failed.
pub const UPSTREAM_FAILED_ERROR: &str = "upstream step failed";

/// One delivery of one job. The dispatcher only sees this seam, so tests can
/// swap in a scripted runner.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_id: &str) -> Result<()>;
}

/// The external engines the pipeline drives.
#[derive(Clone)]
pub struct EngineSet {
    pub scene: Arc<dyn SceneDetector>,
    pub separator: Arc<dyn VocalSeparator>,
    pub transcriber: Arc<dyn SpeechTranscriber>,
}

pub struct Orchestrator {
    repo: Arc<dyn JobRepository>,
    artifacts: ArtifactManager,
    source: SourceMaterializer,
    engines: EngineSet,
    pipeline: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        artifacts: ArtifactManager,
        source: SourceMaterializer,
        engines: EngineSet,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            artifacts,
            source,
            engines,
            pipeline,
        }
    }

    async fn run_job(&self, job_id: &str) -> Result<()> {
        let job = self.repo.get_job(job_id).await?;
        let status = job.job_status()?;
        if status.is_terminal() {
            info!(job_id = %job_id, status = %status, "job already terminal, ignoring redelivery");
            return Ok(());
        }
        // A job found mid-run was interrupted or redelivered. It restarts
        // from scratch, so stale step state is wiped first.
        if status == JobStatus::Processing {
            info!(job_id = %job_id, "redelivered mid-run, resetting step progress");
            self.repo.reset_progress(job_id).await?;
        }
        self.repo
            .set_status(job_id, JobStatus::Processing, None)
            .await?;

        let transient = Mutex::new(Vec::new());
        let outcome = self.execute(&job, &transient).await;
        let result = match outcome {
            Ok(final_result) => match self.finalize(job_id, &final_result).await {
                Ok(()) => Ok(()),
                Err(err) => self.fail(job_id, err).await,
            },
            Err(err) => self.fail(job_id, err).await,
        };

        // Cleanup runs whatever the outcome. It never touches the terminal
        // status already recorded above.
        self.artifacts
            .remove_transient(&transient.into_inner())
            .await;
        result
    }

    async fn execute(
        &self,
        job: &MediaJobDbModel,
        transient: &Mutex<Vec<PathBuf>>,
    ) -> Result<FinalResult> {
        let mode = job.job_audio_mode()?;
        let created_at = job.created_at_utc()?;
        let workspace = self.artifacts.allocate(&job.id, &created_at).await?;

        let source_path = self.source.materialize(&job.source, &workspace).await?;
        transient.lock().await.push(source_path.clone());

        let (scene_outcome, audio_outcome) = tokio::join!(
            self.run_scene_branch(&job.id, &source_path, &workspace.output_dir, mode),
            self.run_audio_branch(&job.id, &source_path, &workspace.output_dir, mode, transient),
        );

        // Both branches have already recorded their own step failures. When
        // both fail, the scene error becomes the job error.
        let scenes = scene_outcome?;
        let (separated, transcription) = audio_outcome?;

        let mut artifacts = Vec::new();
        if self.pipeline.requires(StepKind::SceneCut) {
            for variant in mode.scene_variants() {
                let dir = workspace.output_dir.join(variant.as_str());
                artifacts.push(dir.display().to_string());
            }
        }
        if let Some(separated) = &separated {
            artifacts.extend(separated.vocals.iter().map(|p| p.display().to_string()));
            artifacts.extend(
                separated
                    .accompaniment
                    .iter()
                    .map(|p| p.display().to_string()),
            );
        }
        if let Some(path) = &transcription.transcript_path {
            artifacts.push(path.display().to_string());
        }

        Ok(FinalResult {
            scenes,
            transcription: transcription.text,
            artifacts,
        })
    }

    async fn finalize(&self, job_id: &str, result: &FinalResult) -> Result<()> {
        self.repo.record_result(job_id, result).await?;
        self.repo
            .set_status(job_id, JobStatus::Completed, None)
            .await?;
        info!(job_id = %job_id, scenes = result.scenes.len(), "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: &str, err: Error) -> Result<()> {
        error!(job_id = %job_id, error = %err, "job failed");
        if let Err(store_err) = self
            .repo
            .set_status(job_id, JobStatus::Failed, Some(&err.to_string()))
            .await
        {
            error!(job_id = %job_id, error = %store_err, "could not record job failure");
        }
        Err(err)
    }

    /// Scene detection, one engine call per requested variant. Variant
    /// results are merged in start order; overlap across variants is kept.
    async fn run_scene_branch(
        &self,
        job_id: &str,
        source: &Path,
        output_dir: &Path,
        mode: AudioMode,
    ) -> Result<Vec<Scene>> {
        if !self.pipeline.requires(StepKind::SceneCut) {
            return Ok(Vec::new());
        }
        let step = StepKind::SceneCut;
        self.repo
            .update_step(job_id, step, StepStatus::Processing, None, None)
            .await?;

        let timeout = self.pipeline.step_timeout(step);
        let mut scenes = Vec::new();
        for variant in mode.scene_variants() {
            let request = SceneRequest {
                input_path: source.to_path_buf(),
                output_dir: output_dir.to_path_buf(),
                job_id: job_id.to_string(),
                variant: *variant,
                threshold: DEFAULT_SCENE_THRESHOLD,
            };
            match bounded(step, timeout, self.engines.scene.detect(&request)).await {
                Ok(batch) => scenes.extend(batch),
                Err(err) => {
                    self.record_step_failure(job_id, step, &err).await;
                    return Err(err);
                }
            }
        }
        scenes.sort_by_key(|scene| scene.start_frame);

        let output = serde_json::to_string(&scenes)?;
        self.repo
            .update_step(job_id, step, StepStatus::Success, Some(&output), None)
            .await?;
        Ok(scenes)
    }

    /// Vocal separation followed by transcription. Transcription never starts
    /// unless separation succeeded; a source with no audio stream yields an
    /// empty transcription without an engine call.
    async fn run_audio_branch(
        &self,
        job_id: &str,
        source: &Path,
        output_dir: &Path,
        mode: AudioMode,
        transient: &Mutex<Vec<PathBuf>>,
    ) -> Result<(Option<SeparatedAudio>, Transcription)> {
        if !self.pipeline.requires(StepKind::AudioExtract) {
            return Ok((None, Transcription::empty()));
        }
        let audio_step = StepKind::AudioExtract;
        self.repo
            .update_step(job_id, audio_step, StepStatus::Processing, None, None)
            .await?;

        let request = SeparationRequest {
            input_path: source.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            job_id: job_id.to_string(),
        };
        let separated = match bounded(
            audio_step,
            self.pipeline.step_timeout(audio_step),
            self.engines.separator.separate(&request),
        )
        .await
        {
            Ok(separated) => separated,
            Err(err) => {
                self.record_step_failure(job_id, audio_step, &err).await;
                self.skip_downstream(job_id).await;
                return Err(err);
            }
        };

        // Stems are intermediate files, removed with the source after the
        // run reaches a terminal state.
        {
            let mut transient = transient.lock().await;
            transient.extend(separated.vocals.iter().cloned());
            transient.extend(separated.accompaniment.iter().cloned());
        }
        let output = serde_json::to_string(&separated)?;
        self.repo
            .update_step(job_id, audio_step, StepStatus::Success, Some(&output), None)
            .await?;

        if !self.pipeline.requires(StepKind::TextConvert) {
            return Ok((Some(separated), Transcription::empty()));
        }
        let text_step = StepKind::TextConvert;
        self.repo
            .update_step(job_id, text_step, StepStatus::Processing, None, None)
            .await?;

        let Some(stem) = separated.stem_for(mode.transcription_variant()) else {
            info!(job_id = %job_id, "source has no audio stream, transcription is empty");
            self.repo
                .update_step(job_id, text_step, StepStatus::Success, Some(""), None)
                .await?;
            return Ok((Some(separated), Transcription::empty()));
        };

        let request = TranscriptionRequest {
            audio_path: stem.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            job_id: job_id.to_string(),
        };
        match bounded(
            text_step,
            self.pipeline.step_timeout(text_step),
            self.engines.transcriber.transcribe(&request),
        )
        .await
        {
            Ok(transcription) => {
                self.repo
                    .update_step(
                        job_id,
                        text_step,
                        StepStatus::Success,
                        Some(&transcription.text),
                        None,
                    )
                    .await?;
                Ok((Some(separated), transcription))
            }
            Err(err) => {
                self.record_step_failure(job_id, text_step, &err).await;
                Err(err)
            }
        }
    }

    /// Marks `text_convert` failed without running it, after its upstream
    /// step failed.
    async fn skip_downstream(&self, job_id: &str) {
        if !self.pipeline.requires(StepKind::TextConvert) {
            return;
        }
        if let Err(err) = self
            .repo
            .update_step(
                job_id,
                StepKind::TextConvert,
                StepStatus::Failed,
                None,
                Some(UPSTREAM_FAILED_ERROR),
            )
            .await
        {
            error!(job_id = %job_id, error = %err, "could not mark downstream step skipped");
        }
    }

    async fn record_step_failure(&self, job_id: &str, step: StepKind, err: &Error) {
        warn!(job_id = %job_id, step = %step, error = %err, "step failed");
        if let Err(store_err) = self
            .repo
            .update_step(
                job_id,
                step,
                StepStatus::Failed,
                None,
                Some(&err.to_string()),
            )
            .await
        {
            error!(job_id = %job_id, step = %step, error = %store_err, "could not record step failure");
        }
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, job_id: &str) -> Result<()> {
        self.run_job(job_id).await
    }
}

/// Runs one engine call under the step's deadline, mapping timeouts and
/// engine failures onto step errors.
async fn bounded<T>(
    step: StepKind,
    timeout: Duration,
    call: impl Future<Output = std::result::Result<T, EngineError>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::step_execution(step.as_str(), err.to_string())),
        Err(_) => Err(Error::step_timed_out(step.as_str(), timeout.as_secs())),
    }
}
