//! Environment-driven configuration.
//!
//! Everything is read once at startup; `.env` is loaded by the binary
//! before this module runs.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::models::StepKind;
use crate::{Error, Result};

/// Default source-size ceiling (500 MiB).
const DEFAULT_MAX_SOURCE_BYTES: u64 = 500 * 1024 * 1024;

/// Per-step timeout defaults, in seconds. Scene detection mirrors the
/// detector service's own 30 minute ceiling.
const DEFAULT_SCENE_CUT_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_AUDIO_EXTRACT_TIMEOUT_SECS: u64 = 900;
const DEFAULT_TEXT_CONVERT_TIMEOUT_SECS: u64 = 900;

/// Dispatcher defaults.
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// Engine connect timeout.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Root under which per-job upload and output directories are derived.
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_source_bytes: u64,
    pub engines: EngineConfig,
    pub pipeline: PipelineConfig,
    pub dispatcher: DispatcherConfig,
}

/// Base URLs and connect timeout for the three engine services.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scene_url: String,
    pub separator_url: String,
    pub transcriber_url: String,
    pub connect_timeout: Duration,
}

/// Which steps a job must complete, and each step's deadline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub required_steps: Vec<StepKind>,
    pub scene_cut_timeout: Duration,
    pub audio_extract_timeout: Duration,
    pub text_convert_timeout: Duration,
}

impl PipelineConfig {
    pub fn step_timeout(&self, step: StepKind) -> Duration {
        match step {
            StepKind::SceneCut => self.scene_cut_timeout,
            StepKind::AudioExtract => self.audio_extract_timeout,
            StepKind::TextConvert => self.text_convert_timeout,
        }
    }

    pub fn requires(&self, step: StepKind) -> bool {
        self.required_steps.contains(&step)
    }

    /// A transcription without its feeding extraction can never run.
    fn validate(&self) -> Result<()> {
        if self.required_steps.is_empty() {
            return Err(Error::config("at least one pipeline step must be required"));
        }
        if self.requires(StepKind::TextConvert) && !self.requires(StepKind::AudioExtract) {
            return Err(Error::config(
                "text_convert cannot be required without audio_extract",
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            required_steps: StepKind::ALL.to_vec(),
            scene_cut_timeout: Duration::from_secs(DEFAULT_SCENE_CUT_TIMEOUT_SECS),
            audio_extract_timeout: Duration::from_secs(DEFAULT_AUDIO_EXTRACT_TIMEOUT_SECS),
            text_convert_timeout: Duration::from_secs(DEFAULT_TEXT_CONVERT_TIMEOUT_SECS),
        }
    }
}

/// Worker-pool and redelivery settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// How long one delivery may hold a job before it is taken back.
    pub visibility_timeout: Duration,
    /// Deliveries per job before it is marked failed for good.
    pub max_deliveries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl AppConfig {
    /// Assemble the configuration from the environment, applying defaults
    /// for everything not set.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:medley.db?mode=rwc".to_string());
        let data_dir =
            PathBuf::from(env::var("MEDLEY_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let log_dir =
            PathBuf::from(env::var("MEDLEY_LOG_DIR").unwrap_or_else(|_| "logs".to_string()));

        let engines = EngineConfig {
            scene_url: env::var("MEDLEY_SCENE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
            separator_url: env::var("MEDLEY_SEPARATOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6000".to_string()),
            transcriber_url: env::var("MEDLEY_TRANSCRIBER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6001".to_string()),
            connect_timeout: Duration::from_secs(env_u64(
                "MEDLEY_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
        };

        let pipeline = PipelineConfig {
            required_steps: env_steps("MEDLEY_REQUIRED_STEPS")?,
            scene_cut_timeout: Duration::from_secs(env_u64(
                "MEDLEY_SCENE_CUT_TIMEOUT_SECS",
                DEFAULT_SCENE_CUT_TIMEOUT_SECS,
            )?),
            audio_extract_timeout: Duration::from_secs(env_u64(
                "MEDLEY_AUDIO_EXTRACT_TIMEOUT_SECS",
                DEFAULT_AUDIO_EXTRACT_TIMEOUT_SECS,
            )?),
            text_convert_timeout: Duration::from_secs(env_u64(
                "MEDLEY_TEXT_CONVERT_TIMEOUT_SECS",
                DEFAULT_TEXT_CONVERT_TIMEOUT_SECS,
            )?),
        };
        pipeline.validate()?;

        let dispatcher = DispatcherConfig {
            workers: env_u64("MEDLEY_WORKERS", DEFAULT_WORKERS as u64)?.max(1) as usize,
            visibility_timeout: Duration::from_secs(env_u64(
                "MEDLEY_VISIBILITY_TIMEOUT_SECS",
                DEFAULT_VISIBILITY_TIMEOUT_SECS,
            )?),
            max_deliveries: env_u64("MEDLEY_MAX_DELIVERIES", DEFAULT_MAX_DELIVERIES as u64)?
                .max(1) as u32,
        };

        Ok(Self {
            database_url,
            data_dir,
            log_dir,
            max_source_bytes: env_u64("MEDLEY_MAX_SOURCE_BYTES", DEFAULT_MAX_SOURCE_BYTES)?,
            engines,
            pipeline,
            dispatcher,
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| Error::config(format!("{key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Parses a comma-separated step list, defaulting to all three steps.
fn env_steps(key: &str) -> Result<Vec<StepKind>> {
    match env::var(key) {
        Ok(raw) => {
            let mut steps = Vec::new();
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let step = StepKind::parse(name)
                    .ok_or_else(|| Error::config(format!("{key} has unknown step {name:?}")))?;
                if !steps.contains(&step) {
                    steps.push(step);
                }
            }
            Ok(steps)
        }
        Err(_) => Ok(StepKind::ALL.to_vec()),
    }
}
