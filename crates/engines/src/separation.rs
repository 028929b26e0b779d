use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::scene::SceneVariant;

/// Separation model requested when the caller does not configure one.
pub const DEFAULT_SEPARATION_MODEL: &str = "UVR-MDX-NET-Inst_HQ_3.onnx";

/// Stems produced by one separation pass.
///
/// `has_audio_stream == false` means the source carried no audio at all;
/// both stems are absent and the pass still counts as a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparatedAudio {
    pub has_audio_stream: bool,
    pub vocals: Option<PathBuf>,
    pub accompaniment: Option<PathBuf>,
}

impl SeparatedAudio {
    /// The degenerate result for a source with no audio stream.
    pub fn silent() -> Self {
        Self {
            has_audio_stream: false,
            vocals: None,
            accompaniment: None,
        }
    }

    /// Stem matching the given rendition: vocals for unmuted, the
    /// accompaniment bed for muted.
    pub fn stem_for(&self, variant: SceneVariant) -> Option<&Path> {
        match variant {
            SceneVariant::Unmuted => self.vocals.as_deref(),
            SceneVariant::Muted => self.accompaniment.as_deref(),
        }
    }
}

/// Inputs for one separation pass.
#[derive(Debug, Clone)]
pub struct SeparationRequest {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub job_id: String,
}

#[async_trait]
pub trait VocalSeparator: Send + Sync {
    async fn separate(&self, request: &SeparationRequest) -> Result<SeparatedAudio, EngineError>;
}

/// Client for the vocal-separation service.
///
/// `POST {base}/process/` with query parameters; the service answers 200
/// for both outcomes and signals failure through `status` in the body.
pub struct HttpVocalSeparator {
    base: String,
    model: String,
    client: Client,
}

impl HttpVocalSeparator {
    pub fn new(base: impl Into<String>, client: Client) -> Self {
        Self::with_model(base, DEFAULT_SEPARATION_MODEL, client)
    }

    pub fn with_model(base: impl Into<String>, model: impl Into<String>, client: Client) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }
}

#[derive(Deserialize)]
struct SeparationResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default = "default_true")]
    has_audio_stream: bool,
    #[serde(default)]
    file_paths: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[async_trait]
impl VocalSeparator for HttpVocalSeparator {
    async fn separate(&self, request: &SeparationRequest) -> Result<SeparatedAudio, EngineError> {
        let input_path = request.input_path.to_string_lossy();
        let output_path = request.output_dir.to_string_lossy();

        debug!(job_id = %request.job_id, model = %self.model, "requesting vocal separation");
        let response = self
            .client
            .post(format!("{}/process/", self.base))
            .query(&[
                ("audio_path", input_path.as_ref()),
                ("model", self.model.as_str()),
                ("task_id", request.job_id.as_str()),
                ("output_path", output_path.as_ref()),
            ])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        parse_separation_response(status, &text)
    }
}

fn parse_separation_response(
    status: StatusCode,
    body: &str,
) -> Result<SeparatedAudio, EngineError> {
    if !status.is_success() {
        return Err(EngineError::Rejected(format!("http status {status}")));
    }
    let parsed: SeparationResponse =
        serde_json::from_str(body).map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
    if parsed.status != "success" {
        return Err(EngineError::Failed(parsed.message.unwrap_or_else(|| {
            format!("separation reported status {:?}", parsed.status)
        })));
    }
    if !parsed.has_audio_stream {
        return Ok(SeparatedAudio::silent());
    }
    Ok(SeparatedAudio {
        has_audio_stream: true,
        vocals: stem_path(&parsed.file_paths, "vocals"),
        accompaniment: stem_path(&parsed.file_paths, "accompaniment"),
    })
}

// The service pads absent stems with empty strings rather than omitting
// the key.
fn stem_path(paths: &HashMap<String, String>, stem: &str) -> Option<PathBuf> {
    paths.get(stem).filter(|p| !p.is_empty()).map(PathBuf::from)
}
