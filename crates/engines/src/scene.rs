use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Prediction threshold applied when the caller does not override it.
pub const DEFAULT_SCENE_THRESHOLD: f64 = 0.35;

/// Which audio rendition of the source a detection pass analyzes.
///
/// A job may request one pass or both; the passes are independent engine
/// invocations whose outputs land in variant-named subdirectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneVariant {
    Unmuted,
    Muted,
}

impl SceneVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SceneVariant::Unmuted => "unmuted",
            SceneVariant::Muted => "muted",
        }
    }
}

impl fmt::Display for SceneVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected scene. Frame offsets are absolute within the source; the
/// time fields are the engine's `HH:MM:SS` stamps and are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub start_frame: u64,
    pub end_frame: u64,
    pub start_time: String,
    pub end_time: String,
}

/// Inputs for one detection pass.
#[derive(Debug, Clone)]
pub struct SceneRequest {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub job_id: String,
    pub variant: SceneVariant,
    pub threshold: f64,
}

#[async_trait]
pub trait SceneDetector: Send + Sync {
    async fn detect(&self, request: &SceneRequest) -> Result<Vec<Scene>, EngineError>;
}

/// Client for the scene-detection service.
///
/// `POST {base}/api/v1/scene-detection/process` with a JSON body; faults
/// come back as non-2xx with an `{"error": ...}` body.
pub struct HttpSceneDetector {
    base: String,
    client: Client,
}

impl HttpSceneDetector {
    pub fn new(base: impl Into<String>, client: Client) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct DetectBody<'a> {
    input_path: &'a str,
    output_path: &'a str,
    task_id: &'a str,
    threshold: f64,
}

#[derive(Deserialize)]
struct DetectResponse {
    status: String,
    #[serde(default)]
    scenes: Vec<Scene>,
}

#[async_trait]
impl SceneDetector for HttpSceneDetector {
    async fn detect(&self, request: &SceneRequest) -> Result<Vec<Scene>, EngineError> {
        // Variant passes of the same job must not clobber each other's
        // segment files, so each writes under its own subdirectory.
        let output_dir = request.output_dir.join(request.variant.as_str());
        let task_id = format!("{}-{}", request.job_id, request.variant);
        let input_path = request.input_path.to_string_lossy();
        let output_path = output_dir.to_string_lossy();
        let body = DetectBody {
            input_path: input_path.as_ref(),
            output_path: output_path.as_ref(),
            task_id: &task_id,
            threshold: request.threshold,
        };

        debug!(task_id = %task_id, variant = %request.variant, "requesting scene detection");
        let response = self
            .client
            .post(format!("{}/api/v1/scene-detection/process", self.base))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        parse_detect_response(status, &text)
    }
}

fn parse_detect_response(status: StatusCode, body: &str) -> Result<Vec<Scene>, EngineError> {
    if !status.is_success() {
        return Err(EngineError::Rejected(fault_message(body, status)));
    }
    let parsed: DetectResponse =
        serde_json::from_str(body).map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
    if parsed.status != "success" {
        return Err(EngineError::Failed(format!(
            "scene detection reported status {:?}",
            parsed.status
        )));
    }
    Ok(parsed.scenes)
}

/// Pulls the message out of an `{"error": ...}` fault body, falling back to
/// the HTTP status when the body is not in that shape.
fn fault_message(body: &str, status: StatusCode) -> String {
    #[derive(Deserialize)]
    struct Fault {
        error: String,
    }

    match serde_json::from_str::<Fault>(body) {
        Ok(fault) => fault.error,
        Err(_) => format!("http status {status}"),
    }
}
