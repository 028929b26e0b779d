//! Database models.

pub mod job;

pub use job::{
    AudioMode, FINAL_RESULT_KEY, FinalResult, JobProgress, JobStatus, MediaJobDbModel, StepKind,
    StepState, StepStatus,
};
