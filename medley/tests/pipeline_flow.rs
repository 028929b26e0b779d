//! End-to-end pipeline runs over a real store with scripted engines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engines::{
    EngineError, Scene, SceneDetector, SceneRequest, SceneVariant, SeparatedAudio,
    SeparationRequest, SpeechTranscriber, Transcription, TranscriptionRequest, VocalSeparator,
};
use tempfile::TempDir;

use medley::Error;
use medley::artifacts::ArtifactManager;
use medley::config::PipelineConfig;
use medley::database;
use medley::database::models::{
    AudioMode, JobProgress, JobStatus, MediaJobDbModel, StepKind, StepStatus,
};
use medley::database::repositories::{JobRepository, SqlxJobRepository};
use medley::pipeline::{
    EngineSet, JobRunner, Orchestrator, SourceMaterializer, UPSTREAM_FAILED_ERROR,
};

mockall::mock! {
    SceneEngine {}

    #[async_trait]
    impl SceneDetector for SceneEngine {
        async fn detect(&self, request: &SceneRequest) -> Result<Vec<Scene>, EngineError>;
    }
}

mockall::mock! {
    SeparationEngine {}

    #[async_trait]
    impl VocalSeparator for SeparationEngine {
        async fn separate(&self, request: &SeparationRequest) -> Result<SeparatedAudio, EngineError>;
    }
}

mockall::mock! {
    TranscriptionEngine {}

    #[async_trait]
    impl SpeechTranscriber for TranscriptionEngine {
        async fn transcribe(&self, request: &TranscriptionRequest) -> Result<Transcription, EngineError>;
    }
}

/// Scene detector that never answers within any sane deadline.
struct StalledSceneDetector;

#[async_trait]
impl SceneDetector for StalledSceneDetector {
    async fn detect(&self, _request: &SceneRequest) -> Result<Vec<Scene>, EngineError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

struct TestRig {
    _db_dir: TempDir,
    data_dir: TempDir,
    repo: Arc<SqlxJobRepository>,
}

impl TestRig {
    async fn new() -> Self {
        let db_dir = TempDir::new().unwrap();
        let db_path = db_dir.path().join("medley-test.db");
        let url = format!(
            "sqlite:{}?mode=rwc",
            db_path.to_string_lossy().replace('\\', "/")
        );
        let pool = database::init_pool(&url).await.unwrap();
        database::run_migrations(&pool).await.unwrap();
        Self {
            _db_dir: db_dir,
            data_dir: TempDir::new().unwrap(),
            repo: Arc::new(SqlxJobRepository::new(pool)),
        }
    }

    fn artifacts(&self) -> ArtifactManager {
        ArtifactManager::new(self.data_dir.path())
    }

    async fn stage_upload(&self, name: &str) -> PathBuf {
        let root = self.artifacts().upload_root();
        tokio::fs::create_dir_all(&root).await.unwrap();
        let path = root.join(name);
        tokio::fs::write(&path, b"fake media bytes").await.unwrap();
        path
    }

    /// A file standing in for an engine-produced stem or transcript.
    async fn engine_output(&self, name: &str) -> PathBuf {
        let path = self.data_dir.path().join(name);
        tokio::fs::write(&path, b"engine output").await.unwrap();
        path
    }

    async fn insert_job(&self, source: &str, mode: AudioMode) -> String {
        let job = MediaJobDbModel::new(source, "owner-1", mode, &StepKind::ALL).unwrap();
        assert!(self.repo.create_job(&job).await.unwrap());
        job.id
    }

    fn orchestrator(&self, engines: EngineSet, pipeline: PipelineConfig) -> Orchestrator {
        let artifacts = self.artifacts();
        let source = SourceMaterializer::new(
            reqwest::Client::new(),
            artifacts.upload_root(),
            64 * 1024 * 1024,
        );
        Orchestrator::new(self.repo.clone(), artifacts, source, engines, pipeline)
    }

    async fn job(&self, id: &str) -> MediaJobDbModel {
        self.repo.get_job(id).await.unwrap()
    }

    async fn progress(&self, id: &str) -> JobProgress {
        self.job(id).await.progress_map().unwrap()
    }
}

fn scene(start_frame: u64) -> Scene {
    Scene {
        start_frame,
        end_frame: start_frame + 100,
        start_time: "00:00:00".to_string(),
        end_time: "00:00:04".to_string(),
    }
}

fn engine_set(
    scene: MockSceneEngine,
    separator: MockSeparationEngine,
    transcriber: MockTranscriptionEngine,
) -> EngineSet {
    EngineSet {
        scene: Arc::new(scene),
        separator: Arc::new(separator),
        transcriber: Arc::new(transcriber),
    }
}

#[tokio::test]
async fn successful_job_completes_with_merged_result() {
    let rig = TestRig::new().await;
    let source = rig.stage_upload("video.mp4").await;
    let vocals = rig.engine_output("vocals.wav").await;
    let transcript = rig.engine_output("transcript.txt").await;
    let job_id = rig.insert_job("video.mp4", AudioMode::Both).await;

    let mut scene_engine = MockSceneEngine::new();
    scene_engine
        .expect_detect()
        .withf(|request| request.variant == SceneVariant::Unmuted)
        .times(1)
        .returning(|_| Ok(vec![scene(500)]));
    scene_engine
        .expect_detect()
        .withf(|request| request.variant == SceneVariant::Muted)
        .times(1)
        .returning(|_| Ok(vec![scene(0)]));

    let mut separator = MockSeparationEngine::new();
    let vocals_for_mock = vocals.clone();
    separator.expect_separate().times(1).returning(move |_| {
        Ok(SeparatedAudio {
            has_audio_stream: true,
            vocals: Some(vocals_for_mock.clone()),
            accompaniment: None,
        })
    });

    let mut transcriber = MockTranscriptionEngine::new();
    let vocals_for_check = vocals.clone();
    let transcript_for_mock = transcript.clone();
    transcriber
        .expect_transcribe()
        .withf(move |request| request.audio_path == vocals_for_check)
        .times(1)
        .returning(move |_| {
            Ok(Transcription {
                text: "hello world".to_string(),
                transcript_path: Some(transcript_for_mock.clone()),
            })
        });

    let orchestrator = rig.orchestrator(
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );
    orchestrator.run(&job_id).await.unwrap();

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Completed);
    assert!(job.error.is_none());

    let progress = rig.progress(&job_id).await;
    for step in StepKind::ALL {
        assert_eq!(progress.step(step).unwrap().status, StepStatus::Success);
    }

    let result = progress.final_result().unwrap().unwrap();
    // Variant results are merged in start order.
    let starts: Vec<u64> = result.scenes.iter().map(|s| s.start_frame).collect();
    assert_eq!(starts, vec![0, 500]);
    assert_eq!(result.transcription, "hello world");
    assert!(
        result
            .artifacts
            .contains(&vocals.display().to_string())
    );
    assert!(
        result
            .artifacts
            .contains(&transcript.display().to_string())
    );

    // The materialized source and the stem are transient; the transcript
    // survives the run.
    assert!(!source.exists());
    assert!(!vocals.exists());
    assert!(transcript.exists());
}

#[tokio::test]
async fn scene_failure_fails_the_job_while_the_audio_branch_finishes() {
    let rig = TestRig::new().await;
    rig.stage_upload("video.mp4").await;
    let job_id = rig.insert_job("video.mp4", AudioMode::UnmutedOnly).await;

    let mut scene_engine = MockSceneEngine::new();
    scene_engine
        .expect_detect()
        .times(1)
        .returning(|_| Err(EngineError::Failed("detector crashed".to_string())));

    let mut separator = MockSeparationEngine::new();
    separator.expect_separate().times(1).returning(|_| {
        Ok(SeparatedAudio {
            has_audio_stream: true,
            vocals: Some(PathBuf::from("/tmp/does-not-matter.wav")),
            accompaniment: None,
        })
    });

    let mut transcriber = MockTranscriptionEngine::new();
    transcriber
        .expect_transcribe()
        .times(1)
        .returning(|_| Ok(Transcription::default()));

    let orchestrator = rig.orchestrator(
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );
    let err = orchestrator.run(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::StepExecution { .. }));
    assert_eq!(err.step(), Some("scene_cut"));

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
    let job_error = job.error.unwrap();
    assert!(job_error.contains("scene_cut"), "got {job_error:?}");
    assert!(job_error.contains("detector crashed"), "got {job_error:?}");

    // The failing branch never touched its siblings.
    let progress = rig.progress(&job_id).await;
    let scene_state = progress.step(StepKind::SceneCut).unwrap();
    assert_eq!(scene_state.status, StepStatus::Failed);
    assert!(
        scene_state
            .error
            .as_deref()
            .unwrap()
            .contains("detector crashed")
    );
    assert_eq!(
        progress.step(StepKind::AudioExtract).unwrap().status,
        StepStatus::Success
    );
    assert_eq!(
        progress.step(StepKind::TextConvert).unwrap().status,
        StepStatus::Success
    );
    assert!(progress.final_result().unwrap().is_none());
}

#[tokio::test]
async fn audio_failure_skips_transcription_without_running_it() {
    let rig = TestRig::new().await;
    rig.stage_upload("video.mp4").await;
    let job_id = rig.insert_job("video.mp4", AudioMode::Both).await;

    let mut scene_engine = MockSceneEngine::new();
    scene_engine
        .expect_detect()
        .times(2)
        .returning(|_| Ok(vec![scene(0)]));

    let mut separator = MockSeparationEngine::new();
    separator
        .expect_separate()
        .times(1)
        .returning(|_| Err(EngineError::Failed("separator out of memory".to_string())));

    let mut transcriber = MockTranscriptionEngine::new();
    transcriber.expect_transcribe().times(0);

    let orchestrator = rig.orchestrator(
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );
    orchestrator.run(&job_id).await.unwrap_err();

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
    assert!(job.error.unwrap().contains("audio_extract"));

    let progress = rig.progress(&job_id).await;
    assert_eq!(
        progress.step(StepKind::SceneCut).unwrap().status,
        StepStatus::Success
    );
    assert_eq!(
        progress.step(StepKind::AudioExtract).unwrap().status,
        StepStatus::Failed
    );
    let text = progress.step(StepKind::TextConvert).unwrap();
    assert_eq!(text.status, StepStatus::Failed);
    assert_eq!(text.error.as_deref(), Some(UPSTREAM_FAILED_ERROR));
}

#[tokio::test]
async fn silent_source_completes_with_an_empty_transcription() {
    let rig = TestRig::new().await;
    rig.stage_upload("mute.mp4").await;
    let job_id = rig.insert_job("mute.mp4", AudioMode::UnmutedOnly).await;

    let mut scene_engine = MockSceneEngine::new();
    scene_engine
        .expect_detect()
        .times(1)
        .returning(|_| Ok(vec![scene(0)]));

    let mut separator = MockSeparationEngine::new();
    separator
        .expect_separate()
        .times(1)
        .returning(|_| Ok(SeparatedAudio::silent()));

    // Nothing to transcribe: the engine must not be called at all.
    let mut transcriber = MockTranscriptionEngine::new();
    transcriber.expect_transcribe().times(0);

    let orchestrator = rig.orchestrator(
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );
    orchestrator.run(&job_id).await.unwrap();

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Completed);

    let progress = rig.progress(&job_id).await;
    let audio = progress.step(StepKind::AudioExtract).unwrap();
    assert_eq!(audio.status, StepStatus::Success);
    let separated: SeparatedAudio =
        serde_json::from_str(audio.output.as_deref().unwrap()).unwrap();
    assert!(!separated.has_audio_stream);

    let text = progress.step(StepKind::TextConvert).unwrap();
    assert_eq!(text.status, StepStatus::Success);
    assert_eq!(text.output.as_deref(), Some(""));

    let result = progress.final_result().unwrap().unwrap();
    assert_eq!(result.transcription, "");
}

#[tokio::test]
async fn stalled_scene_detector_times_out_without_touching_siblings() {
    let rig = TestRig::new().await;
    rig.stage_upload("video.mp4").await;
    let job_id = rig.insert_job("video.mp4", AudioMode::UnmutedOnly).await;

    let mut separator = MockSeparationEngine::new();
    separator
        .expect_separate()
        .times(1)
        .returning(|_| Ok(SeparatedAudio::silent()));
    let mut transcriber = MockTranscriptionEngine::new();
    transcriber.expect_transcribe().times(0);

    let engines = EngineSet {
        scene: Arc::new(StalledSceneDetector),
        separator: Arc::new(separator),
        transcriber: Arc::new(transcriber),
    };
    let pipeline = PipelineConfig {
        scene_cut_timeout: Duration::from_millis(200),
        ..PipelineConfig::default()
    };

    let orchestrator = rig.orchestrator(engines, pipeline);
    let err = orchestrator.run(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::StepTimedOut { .. }));
    assert_eq!(err.step(), Some("scene_cut"));

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
    assert!(job.error.unwrap().contains("scene_cut"));

    let progress = rig.progress(&job_id).await;
    let scene_state = progress.step(StepKind::SceneCut).unwrap();
    assert_eq!(scene_state.status, StepStatus::Failed);
    assert!(scene_state.error.as_deref().unwrap().contains("timed out"));
    // The audio branch was unaffected by the timeout.
    assert_eq!(
        progress.step(StepKind::AudioExtract).unwrap().status,
        StepStatus::Success
    );
    assert_eq!(
        progress.step(StepKind::TextConvert).unwrap().status,
        StepStatus::Success
    );
}

#[tokio::test]
async fn redelivered_job_restarts_from_scratch_and_then_stays_settled() {
    let rig = TestRig::new().await;
    rig.stage_upload("video.mp4").await;
    let job_id = rig.insert_job("video.mp4", AudioMode::UnmutedOnly).await;

    // A previous delivery died mid-run: job Processing, one step underway.
    rig.repo
        .set_status(&job_id, JobStatus::Processing, None)
        .await
        .unwrap();
    rig.repo
        .update_step(&job_id, StepKind::SceneCut, StepStatus::Processing, None, None)
        .await
        .unwrap();

    let mut scene_engine = MockSceneEngine::new();
    scene_engine
        .expect_detect()
        .times(1)
        .returning(|_| Ok(vec![scene(0)]));
    let mut separator = MockSeparationEngine::new();
    separator
        .expect_separate()
        .times(1)
        .returning(|_| Ok(SeparatedAudio::silent()));
    let mut transcriber = MockTranscriptionEngine::new();
    transcriber.expect_transcribe().times(0);

    let orchestrator = rig.orchestrator(
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );
    orchestrator.run(&job_id).await.unwrap();
    assert_eq!(
        rig.job(&job_id).await.job_status().unwrap(),
        JobStatus::Completed
    );

    // A late duplicate delivery is a no-op: every engine expectation above
    // is already exhausted, and the snapshot does not change.
    let before = rig.job(&job_id).await;
    orchestrator.run(&job_id).await.unwrap();
    let after = rig.job(&job_id).await;
    assert_eq!(before.status, after.status);
    assert_eq!(before.progress, after.progress);
    assert_eq!(before.updated_at, after.updated_at);
}

#[tokio::test]
async fn oversized_source_fails_validation_before_any_step_runs() {
    let rig = TestRig::new().await;

    let root = rig.artifacts().upload_root();
    tokio::fs::create_dir_all(&root).await.unwrap();
    tokio::fs::write(root.join("huge.mp4"), vec![0u8; 256])
        .await
        .unwrap();
    let job_id = rig.insert_job("huge.mp4", AudioMode::Both).await;

    let mut scene_engine = MockSceneEngine::new();
    scene_engine.expect_detect().times(0);
    let mut separator = MockSeparationEngine::new();
    separator.expect_separate().times(0);
    let mut transcriber = MockTranscriptionEngine::new();
    transcriber.expect_transcribe().times(0);

    let artifacts = rig.artifacts();
    let source = SourceMaterializer::new(reqwest::Client::new(), artifacts.upload_root(), 16);
    let orchestrator = Orchestrator::new(
        rig.repo.clone(),
        artifacts,
        source,
        engine_set(scene_engine, separator, transcriber),
        PipelineConfig::default(),
    );

    let err = orchestrator.run(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let job = rig.job(&job_id).await;
    assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
    assert!(job.error.unwrap().contains("exceeds"));

    // Rejected before any step: the whole map is still idle.
    let progress = rig.progress(&job_id).await;
    for step in StepKind::ALL {
        assert_eq!(progress.step(step).unwrap().status, StepStatus::Idle);
    }
}
