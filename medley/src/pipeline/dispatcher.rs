//! In-process job dispatch.
//!
//! Accepted jobs are queued in memory and delivered to a bounded pool of
//! workers. Delivery is at-least-once: a worker holds a job for at most the
//! visibility timeout, and a delivery that fails without reaching a terminal
//! state is requeued until the delivery ceiling is hit. The durable record
//! lives in the store, so a restart recovers by requeueing every unfinished
//! job.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::database::models::JobStatus;
use crate::database::repositories::JobRepository;
use crate::pipeline::JobRunner;
use crate::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Error recorded on a job abandoned after exhausting its deliveries.
pub const DELIVERY_CEILING_ERROR: &str = "delivery ceiling reached";

pub struct JobDispatcher {
    shared: Arc<Shared>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

struct Shared {
    repo: Arc<dyn JobRepository>,
    runner: Arc<dyn JobRunner>,
    config: DispatcherConfig,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    deliveries: DashMap<String, u32>,
    in_flight: DashSet<String>,
    cancel: CancellationToken,
}

impl JobDispatcher {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        runner: Arc<dyn JobRunner>,
        config: DispatcherConfig,
    ) -> Self {
        let workers = config.workers;
        Self {
            shared: Arc::new(Shared {
                repo,
                runner,
                config,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                semaphore: Arc::new(Semaphore::new(workers)),
                deliveries: DashMap::new(),
                in_flight: DashSet::new(),
                cancel: CancellationToken::new(),
            }),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the worker loops.
    pub async fn start(&self) {
        info!(
            workers = self.shared.config.workers,
            visibility_timeout_secs = self.shared.config.visibility_timeout.as_secs(),
            "starting job dispatcher"
        );
        let mut tasks = self.tasks.lock().await;
        if let Some(join_set) = tasks.as_mut() {
            for index in 0..self.shared.config.workers {
                let shared = self.shared.clone();
                join_set.spawn(worker(shared, index));
            }
        }
    }

    /// Queue a job for delivery. Duplicates of an already queued job are
    /// dropped.
    pub async fn submit(&self, job_id: impl Into<String>) {
        self.shared.push(job_id.into()).await;
    }

    /// Requeue every job the store still reports as unfinished. Called once
    /// at startup so jobs interrupted by a crash get re-executed.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.shared.repo.list_unfinished_jobs().await?;
        let count = unfinished.len();
        for job in unfinished {
            self.shared.push(job.id).await;
        }
        if count > 0 {
            info!(count, "requeued unfinished jobs from a previous run");
        }
        Ok(count)
    }

    /// Number of deliveries waiting for a worker.
    pub async fn queued_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Stop the workers and wait for in-flight deliveries to settle.
    pub async fn stop(&self) {
        info!("stopping job dispatcher");
        self.shared.cancel.cancel();
        let join_set = self.tasks.lock().await.take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        info!("job dispatcher stopped");
    }
}

impl Shared {
    async fn push(&self, job_id: String) {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued == &job_id) {
                debug!(job_id = %job_id, "job already queued");
                return;
            }
            queue.push_back(job_id);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<String> {
        self.queue.lock().await.pop_front()
    }

    async fn deliver(&self, job_id: &str) {
        let attempt = {
            let mut count = self.deliveries.entry(job_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(job_id = %job_id, attempt, "delivery started");

        let outcome = tokio::time::timeout(
            self.config.visibility_timeout,
            self.runner.run(job_id),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {
                self.deliveries.remove(job_id);
            }
            Ok(Err(err)) => {
                warn!(job_id = %job_id, attempt, error = %err, "delivery failed");
                self.redeliver_if_unfinished(job_id).await;
            }
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    attempt,
                    timeout_secs = self.config.visibility_timeout.as_secs(),
                    "delivery exceeded the visibility timeout"
                );
                self.redeliver_if_unfinished(job_id).await;
            }
        }
    }

    /// A failed delivery only gets another one if the job never reached a
    /// terminal state. A run that recorded COMPLETED or FAILED is settled no
    /// matter what the delivery reported.
    async fn redeliver_if_unfinished(&self, job_id: &str) {
        match self.repo.get_job(job_id).await {
            Ok(job) => match job.job_status() {
                Ok(status) if status.is_terminal() => {
                    self.deliveries.remove(job_id);
                }
                Ok(_) => self.requeue_or_abandon(job_id).await,
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "job status unreadable, dropping delivery");
                    self.deliveries.remove(job_id);
                }
            },
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "could not check job after delivery");
                self.requeue_or_abandon(job_id).await;
            }
        }
    }

    async fn requeue_or_abandon(&self, job_id: &str) {
        let attempts = self.deliveries.get(job_id).map(|entry| *entry).unwrap_or(0);
        if attempts >= self.config.max_deliveries {
            warn!(job_id = %job_id, attempts, "delivery ceiling reached, abandoning job");
            self.deliveries.remove(job_id);
            self.mark_abandoned(job_id).await;
        } else {
            self.push(job_id.to_string()).await;
        }
    }

    /// Best-effort terminal write for a job nothing will deliver again. The
    /// job may still be PENDING if its first status write never landed, so
    /// it is walked through PROCESSING first.
    async fn mark_abandoned(&self, job_id: &str) {
        let _ = self
            .repo
            .set_status(job_id, JobStatus::Processing, None)
            .await;
        if let Err(err) = self
            .repo
            .set_status(job_id, JobStatus::Failed, Some(DELIVERY_CEILING_ERROR))
            .await
        {
            error!(job_id = %job_id, error = %err, "could not mark abandoned job failed");
        }
    }
}

async fn worker(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "dispatch worker started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let permit = match shared.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => continue,
        };
        let Some(job_id) = shared.pop().await else {
            drop(permit);
            continue;
        };
        // Two queued copies of one job must not run concurrently.
        if !shared.in_flight.insert(job_id.clone()) {
            debug!(job_id = %job_id, "job already in flight, dropping duplicate delivery");
            drop(permit);
            continue;
        }

        shared.deliver(&job_id).await;

        shared.in_flight.remove(&job_id);
        drop(permit);
    }
    debug!(worker = index, "dispatch worker stopped");
}
