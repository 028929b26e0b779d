//! Media job database models.

use std::collections::BTreeMap;

use engines::{Scene, SceneVariant};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{Error, Result};

/// Progress-map key of the synthetic entry holding the aggregated result.
pub const FINAL_RESULT_KEY: &str = "final_result";

/// Media job database model.
/// Represents one end-to-end processing request and its tracked state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MediaJobDbModel {
    pub id: String,
    /// Source reference: http(s) URL or an upload token
    pub source: String,
    pub owner_id: String,
    /// Audio mode: both, unmuted-only, muted-only
    pub audio_mode: String,
    /// Status: PENDING, PROCESSING, COMPLETED, FAILED
    pub status: String,
    /// JSON blob mapping step name to { status, output, error }
    pub progress: String,
    /// Job-level error message, set once the job fails
    pub error: Option<String>,
    /// ISO 8601 timestamp when the job was created
    pub created_at: String,
    /// ISO 8601 timestamp when the job was last updated
    pub updated_at: String,
}

impl MediaJobDbModel {
    /// Creates a Pending record with its progress map seeded to `idle` for
    /// every step in `steps`.
    pub fn new(
        source: impl Into<String>,
        owner_id: impl Into<String>,
        audio_mode: AudioMode,
        steps: &[StepKind],
    ) -> Result<Self> {
        let now = chrono::Utc::now().to_rfc3339();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            owner_id: owner_id.into(),
            audio_mode: audio_mode.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            progress: JobProgress::initial(steps).to_json()?,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn job_status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status)
            .ok_or_else(|| Error::validation(format!("unknown job status {:?}", self.status)))
    }

    pub fn job_audio_mode(&self) -> Result<AudioMode> {
        AudioMode::parse(&self.audio_mode)
            .ok_or_else(|| Error::validation(format!("unknown audio mode {:?}", self.audio_mode)))
    }

    pub fn progress_map(&self) -> Result<JobProgress> {
        JobProgress::from_json(&self.progress)
    }

    /// Creation instant, used to derive the job's workspace partition.
    pub fn created_at_utc(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        Ok(chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::validation(format!("bad created_at timestamp: {e}")))?
            .with_timezone(&chrono::Utc))
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is recorded and waiting to be picked up by a worker.
    Pending,
    /// A worker is driving the pipeline for this job.
    Processing,
    /// All required steps succeeded and the result is recorded.
    Completed,
    /// A required step failed, or delivery was exhausted.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses a row may hold for a transition into `self` to be legal.
    ///
    /// Processing from Processing covers redelivery of a half-run job;
    /// terminal rows are never overwritten.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending, Self::Processing],
            Self::Completed => &[Self::Processing],
            Self::Failed => &[Self::Processing],
        }
    }
}

/// Per-step status values inside the progress map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Idle,
    Processing,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Legal forward transitions. Idle to failed is the upstream-skip
    /// write for a step whose prerequisite failed; success is final.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Processing)
                | (Self::Idle, Self::Failed)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::Failed)
        )
    }
}

/// The three pipeline steps tracked in the progress map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SceneCut,
    AudioExtract,
    TextConvert,
}

impl StepKind {
    pub const ALL: [StepKind; 3] = [Self::SceneCut, Self::AudioExtract, Self::TextConvert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SceneCut => "scene_cut",
            Self::AudioExtract => "audio_extract",
            Self::TextConvert => "text_convert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scene_cut" => Some(Self::SceneCut),
            "audio_extract" => Some(Self::AudioExtract),
            "text_convert" => Some(Self::TextConvert),
            _ => None,
        }
    }
}

/// Which scene-detection variants a job runs, and which stem feeds
/// transcription.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum AudioMode {
    Both,
    UnmutedOnly,
    MutedOnly,
}

impl AudioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Both => "both",
            Self::UnmutedOnly => "unmuted-only",
            Self::MutedOnly => "muted-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "both" => Some(Self::Both),
            "unmuted-only" => Some(Self::UnmutedOnly),
            "muted-only" => Some(Self::MutedOnly),
            _ => None,
        }
    }

    /// Scene-detection passes this mode requires, in invocation order.
    pub fn scene_variants(&self) -> &'static [SceneVariant] {
        match self {
            Self::Both => &[SceneVariant::Unmuted, SceneVariant::Muted],
            Self::UnmutedOnly => &[SceneVariant::Unmuted],
            Self::MutedOnly => &[SceneVariant::Muted],
        }
    }

    /// Stem fed to transcription.
    pub fn transcription_variant(&self) -> SceneVariant {
        match self {
            Self::MutedOnly => SceneVariant::Muted,
            _ => SceneVariant::Unmuted,
        }
    }
}

/// One step's entry inside the progress map.
///
/// `error` is populated iff `status` is failed; `output` only once the
/// step succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn idle() -> Self {
        Self {
            status: StepStatus::Idle,
            output: None,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Typed view over the progress JSON column: step name to step state.
///
/// A BTreeMap keeps the serialized form stable across rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobProgress(pub BTreeMap<String, StepState>);

impl JobProgress {
    /// Progress map for a fresh job: every listed step idle, no result.
    pub fn initial(steps: &[StepKind]) -> Self {
        Self(
            steps
                .iter()
                .map(|step| (step.as_str().to_string(), StepState::idle()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&StepState> {
        self.0.get(key)
    }

    pub fn step(&self, kind: StepKind) -> Option<&StepState> {
        self.0.get(kind.as_str())
    }

    pub fn final_result(&self) -> Result<Option<FinalResult>> {
        match self.0.get(FINAL_RESULT_KEY).and_then(|s| s.output.as_deref()) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Aggregated output persisted under the `final_result` entry once every
/// required step has succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub scenes: Vec<Scene>,
    pub transcription: String,
    /// References to retained artifacts (stems, transcript file).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}
