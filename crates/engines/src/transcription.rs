use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Transcription of one audio stem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub transcript_path: Option<PathBuf>,
}

impl Transcription {
    /// The result recorded for sources with nothing to transcribe.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Inputs for one transcription pass.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio_path: PathBuf,
    pub output_dir: PathBuf,
    pub job_id: String,
}

#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    async fn transcribe(&self, request: &TranscriptionRequest)
    -> Result<Transcription, EngineError>;
}

/// Client for the speech-transcription service.
///
/// `POST {base}/api/v1/audio-transcription/process` with a JSON body. The
/// service answers 200 for every outcome and reports failures through
/// `status: "error"` plus a message.
pub struct HttpSpeechTranscriber {
    base: String,
    client: Client,
}

impl HttpSpeechTranscriber {
    pub fn new(base: impl Into<String>, client: Client) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct TranscribeBody<'a> {
    audio_path: &'a str,
    output_path: &'a str,
    task_id: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    transcription: Option<String>,
    #[serde(default)]
    transcription_path: Option<String>,
}

#[async_trait]
impl SpeechTranscriber for HttpSpeechTranscriber {
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<Transcription, EngineError> {
        let audio_path = request.audio_path.to_string_lossy();
        let output_path = request.output_dir.to_string_lossy();
        let body = TranscribeBody {
            audio_path: audio_path.as_ref(),
            output_path: output_path.as_ref(),
            task_id: &request.job_id,
        };

        debug!(job_id = %request.job_id, "requesting transcription");
        let response = self
            .client
            .post(format!("{}/api/v1/audio-transcription/process", self.base))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        parse_transcribe_response(status, &text)
    }
}

fn parse_transcribe_response(status: StatusCode, body: &str) -> Result<Transcription, EngineError> {
    if !status.is_success() {
        return Err(EngineError::Rejected(format!("http status {status}")));
    }
    let parsed: TranscribeResponse =
        serde_json::from_str(body).map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
    if parsed.status != "success" {
        return Err(EngineError::Failed(parsed.message.unwrap_or_else(|| {
            format!("transcription reported status {:?}", parsed.status)
        })));
    }
    Ok(Transcription {
        text: parsed.transcription.unwrap_or_default(),
        transcript_path: parsed
            .transcription_path
            .filter(|p| !p.is_empty())
            .map(PathBuf::from),
    })
}
