use thiserror::Error;

/// Failures surfaced by an engine call.
///
/// `Rejected` is the engine refusing the request up front (bad input,
/// missing file); `Failed` is the engine accepting it and then reporting a
/// processing failure in its response body.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("engine failure: {0}")]
    Failed(String),
    #[error("invalid engine response: {0}")]
    InvalidResponse(String),
}
