//! Repository layer for database access.
//!
//! Abstracts all job-record interactions behind a trait so the pipeline
//! can be driven against fakes in tests.

pub mod job;

pub use job::*;
