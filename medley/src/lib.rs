//! medley library crate.
//!
//! Exposes the job store, pipeline, and service surface for integration
//! testing and embedding.

pub mod artifacts;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod service;

pub use error::{Error, Result};
