//! Per-job working directories and transient-artifact removal.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Derives and creates the filesystem layout for job artifacts.
///
/// Paths are a pure function of the data root, the job id and the job's
/// creation date, so any worker re-deriving them for the same job lands on
/// the same directories. Year/month partitioning bounds directory fan-out.
/// Nothing here deletes on its own; the orchestrator decides what is
/// transient and when it goes.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    data_dir: PathBuf,
}

/// The two per-job directories for one run.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    /// Where the materialized source lives.
    pub upload_dir: PathBuf,
    /// Where step outputs (segments, stems, transcript) are written.
    pub output_dir: PathBuf,
}

impl ArtifactManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root where the front end stages uploaded files, keyed by token.
    pub fn upload_root(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Derives the workspace for a job created at `created_at` and creates
    /// both directories. Safe to call again for the same job.
    pub async fn allocate(
        &self,
        job_id: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<JobWorkspace> {
        let partition = format!("{:04}/{:02}", created_at.year(), created_at.month());
        let upload_dir = self
            .data_dir
            .join("uploads")
            .join(&partition)
            .join(job_id);
        let output_dir = self
            .data_dir
            .join("processed")
            .join(&partition)
            .join(job_id);

        ensure_dir_all("creating upload directory", &upload_dir).await?;
        ensure_dir_all("creating output directory", &output_dir).await?;
        debug!(job_id = %job_id, upload_dir = %upload_dir.display(), output_dir = %output_dir.display(), "job workspace ready");

        Ok(JobWorkspace {
            upload_dir,
            output_dir,
        })
    }

    /// Best-effort removal of transient files. Missing files are fine;
    /// other failures are logged and swallowed, never escalated.
    pub async fn remove_transient(&self, paths: &[PathBuf]) {
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed transient artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove transient artifact")
                }
            }
        }
    }
}

/// Ensure a directory exists, creating it recursively, with operation and
/// path context on failure.
pub async fn ensure_dir_all(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}
