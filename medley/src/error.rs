//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Step-scoped variants (`StepTimedOut`, `StepExecution`, `UpstreamSkipped`)
/// carry the step name so the failure can be recorded against the right
/// entry of a job's progress map before it surfaces as the job error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Step {step} timed out after {timeout_secs}s")]
    StepTimedOut { step: String, timeout_secs: u64 },

    #[error("Step {step} failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("Step {step} skipped: upstream step failed")]
    UpstreamSkipped { step: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download error: {0}")]
    Download(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// IO error with operation + path context.
    pub fn io_path(op: &'static str, path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn step_timed_out(step: impl Into<String>, timeout_secs: u64) -> Self {
        Self::StepTimedOut {
            step: step.into(),
            timeout_secs,
        }
    }

    pub fn step_execution(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }

    /// The step this error is attributable to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepTimedOut { step, .. }
            | Self::StepExecution { step, .. }
            | Self::UpstreamSkipped { step } => Some(step),
            _ => None,
        }
    }
}
