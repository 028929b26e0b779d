//! Media processing pipeline.
//!
//! The pipeline is responsible for:
//! - Materializing job sources (remote download or staged upload)
//! - Driving the processing steps against the external engines
//! - Recording per-step and whole-job state transitions in the store
//! - Dispatching queued jobs to a bounded worker pool

mod dispatcher;
mod orchestrator;
mod source;

pub use dispatcher::{DELIVERY_CEILING_ERROR, JobDispatcher};
pub use orchestrator::{EngineSet, JobRunner, Orchestrator, UPSTREAM_FAILED_ERROR};
pub use source::SourceMaterializer;
