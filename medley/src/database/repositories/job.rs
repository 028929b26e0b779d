//! Media job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::database::models::{
    FINAL_RESULT_KEY, FinalResult, JobStatus, MediaJobDbModel, StepKind, StepState, StepStatus,
};
use crate::{Error, Result, database};

/// Durable store for job records.
///
/// One row owns a whole job; step-level writes go through a
/// read-modify-write of the progress blob that touches only the addressed
/// entry. The two branches of one job write concurrently, so every
/// read-modify-write runs under an immediate transaction.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts the Pending record. Returns false when the id already
    /// exists; the existing row is left untouched.
    async fn create_job(&self, job: &MediaJobDbModel) -> Result<bool>;

    async fn get_job(&self, id: &str) -> Result<MediaJobDbModel>;

    /// Pending and Processing jobs, oldest first.
    async fn list_unfinished_jobs(&self) -> Result<Vec<MediaJobDbModel>>;

    /// Updates the top-level status, guarded so a terminal row is never
    /// overwritten and the lifecycle never regresses. The job-level error
    /// message is stored only with a Failed status.
    async fn set_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()>;

    /// Rewrites the addressed step's entry, leaving every sibling entry
    /// byte-for-byte intact. Output is kept only on success, the error
    /// message only on failure.
    async fn update_step(
        &self,
        id: &str,
        step: StepKind,
        status: StepStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Stores the aggregated result under the synthetic final_result
    /// entry. Must happen before the Completed transition.
    async fn record_result(&self, id: &str, result: &FinalResult) -> Result<()>;

    /// Returns every step of a redelivered job to idle and drops any
    /// recorded result, so re-execution starts from an accurate record.
    async fn reset_progress(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &MediaJobDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO media_jobs
                (id, source, owner_id, audio_mode, status, progress, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.source)
        .bind(&job.owner_id)
        .bind(&job.audio_mode)
        .bind(&job.status)
        .bind(&job.progress)
        .bind(&job.error)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, id: &str) -> Result<MediaJobDbModel> {
        sqlx::query_as::<_, MediaJobDbModel>("SELECT * FROM media_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("MediaJob", id))
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<MediaJobDbModel>> {
        let jobs = sqlx::query_as::<_, MediaJobDbModel>(
            "SELECT * FROM media_jobs WHERE status IN ('PENDING', 'PROCESSING') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn set_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let predecessors = status.allowed_predecessors();
        if predecessors.is_empty() {
            return Err(Error::InvalidStateTransition {
                from: "any".to_string(),
                to: status.as_str().to_string(),
            });
        }

        let now = chrono::Utc::now().to_rfc3339();
        let error = error.filter(|_| status == JobStatus::Failed);
        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = format!(
            "UPDATE media_jobs SET status = ?, error = ?, updated_at = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(error)
            .bind(&now)
            .bind(id);
        for predecessor in predecessors {
            query = query.bind(predecessor.as_str());
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            let current = sqlx::query_scalar::<_, String>(
                "SELECT status FROM media_jobs WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            return match current {
                Some(from) => {
                    warn!(
                        job_id = %id,
                        from = %from,
                        to = %status,
                        "rejected job status transition"
                    );
                    Err(Error::InvalidStateTransition {
                        from,
                        to: status.as_str().to_string(),
                    })
                }
                None => Err(Error::not_found("MediaJob", id)),
            };
        }
        Ok(())
    }

    async fn update_step(
        &self,
        id: &str,
        step: StepKind,
        status: StepStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tx = database::begin_immediate(&self.pool).await?;
        let job = sqlx::query_as::<_, MediaJobDbModel>("SELECT * FROM media_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("MediaJob", id))?;

        if job.job_status()?.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.status,
                to: format!("{} {}", step, status),
            });
        }

        let mut progress = job.progress_map()?;
        let entry = progress
            .0
            .get_mut(step.as_str())
            .ok_or_else(|| Error::validation(format!("step {step} is not tracked for job {id}")))?;
        if !entry.status.can_transition_to(status) {
            warn!(
                job_id = %id,
                step = %step,
                from = %entry.status,
                to = %status,
                "rejected step transition"
            );
            return Err(Error::InvalidStateTransition {
                from: format!("{} {}", step, entry.status),
                to: format!("{} {}", step, status),
            });
        }

        *entry = StepState {
            status,
            output: match status {
                StepStatus::Success => output.map(str::to_string),
                _ => None,
            },
            error: match status {
                StepStatus::Failed => Some(error.unwrap_or("unknown error").to_string()),
                _ => None,
            },
        };

        let raw = progress.to_json()?;
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE media_jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(&raw)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_result(&self, id: &str, result: &FinalResult) -> Result<()> {
        let mut tx = database::begin_immediate(&self.pool).await?;
        let job = sqlx::query_as::<_, MediaJobDbModel>("SELECT * FROM media_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("MediaJob", id))?;

        if job.job_status()?.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.status,
                to: FINAL_RESULT_KEY.to_string(),
            });
        }

        let mut progress = job.progress_map()?;
        progress.0.insert(
            FINAL_RESULT_KEY.to_string(),
            StepState {
                status: StepStatus::Success,
                output: Some(serde_json::to_string(result)?),
                error: None,
            },
        );

        let raw = progress.to_json()?;
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE media_jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(&raw)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_progress(&self, id: &str) -> Result<()> {
        let mut tx = database::begin_immediate(&self.pool).await?;
        let job = sqlx::query_as::<_, MediaJobDbModel>("SELECT * FROM media_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("MediaJob", id))?;

        if job.job_status()?.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.status,
                to: "idle".to_string(),
            });
        }

        let mut progress = job.progress_map()?;
        progress.0.remove(FINAL_RESULT_KEY);
        for state in progress.0.values_mut() {
            *state = StepState::idle();
        }

        let raw = progress.to_json()?;
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE media_jobs SET progress = ?, error = NULL, updated_at = ? WHERE id = ?")
            .bind(&raw)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
