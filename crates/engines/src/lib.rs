//! Clients for the three external media-analysis engines.
//!
//! Each engine is exposed as a trait (`SceneDetector`, `VocalSeparator`,
//! `SpeechTranscriber`) plus an HTTP implementation speaking that engine's
//! wire protocol. Callers own call deadlines; the clients here only bound
//! connection establishment.

pub mod client;
pub mod error;
pub mod scene;
pub mod separation;
pub mod transcription;

pub use client::build_client;
pub use error::EngineError;
pub use scene::{
    DEFAULT_SCENE_THRESHOLD, HttpSceneDetector, Scene, SceneDetector, SceneRequest, SceneVariant,
};
pub use separation::{HttpVocalSeparator, SeparatedAudio, SeparationRequest, VocalSeparator};
pub use transcription::{
    HttpSpeechTranscriber, SpeechTranscriber, Transcription, TranscriptionRequest,
};
