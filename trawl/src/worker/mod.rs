//! Worker execution loop.
//!
//! Workers pull one task at a time from the shared queue under a fixed
//! concurrency bound and a global rate limiter, acquire a credential,
//! invoke the scrape backend with a cancellation token, and report the
//! outcome back to the job store and credential pool.

pub mod rate_limiter;

pub use rate_limiter::{RateLimiterConfig, WindowRateLimiter};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::StatusAggregator;
use crate::cancellation::CancellationChannel;
use crate::database::models::{
    CredentialDbModel, JobDbModel, JobStatus, JobUpdate, QueueTaskDbModel, UsageRecordDbModel,
};
use crate::database::repositories::{CredentialRepository, JobRepository};
use crate::queue::{TaskPayload, TaskQueue};
use crate::scrape::{ResultStore, ScrapeBackend, ScrapeOutcome, ScrapeRequest, result_file_name};
use crate::{Error, Result};

/// Interval between cancellation-flag polls while a backend run is active.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops. Keep at or below the smallest
    /// per-platform credential count (see the selection race note on the
    /// credential repository).
    pub max_workers: usize,
    /// Poll interval when the queue is quiet.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            poll_interval_ms: 500,
        }
    }
}

/// Shared handles a worker needs to execute one task.
pub struct WorkerContext {
    pub jobs: Arc<dyn JobRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub queue: Arc<TaskQueue>,
    pub cancellation: Arc<dyn CancellationChannel>,
    pub backend: Arc<dyn ScrapeBackend>,
    pub results: Arc<ResultStore>,
    pub limiter: Arc<WindowRateLimiter>,
    pub aggregator: Arc<StatusAggregator>,
    /// Days a result file is retained before the cleanup service may
    /// delete it.
    pub result_retention_days: u64,
}

/// The worker pool.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker loops.
    pub fn start(&self, ctx: Arc<WorkerContext>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        info!("Starting worker pool with {} workers", self.config.max_workers);

        let mut tasks = self.tasks.lock();
        if let Some(join_set) = tasks.as_mut() {
            for i in 0..self.config.max_workers {
                let ctx = ctx.clone();
                let token = self.cancellation_token.clone();
                let notifier = ctx.queue.notifier();

                join_set.spawn(async move {
                    debug!("Worker {} started", i);

                    loop {
                        if token.is_cancelled() {
                            debug!("Worker {} shutting down", i);
                            break;
                        }

                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }

                        // Drain whatever is runnable before sleeping again.
                        loop {
                            if token.is_cancelled() {
                                break;
                            }
                            match process_next_task(&ctx).await {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => {
                                    error!("Worker {} task error: {}", i, e);
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    }

    /// Stop the worker pool, letting in-flight tasks finish.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Claim and execute the next runnable task.
///
/// Returns `Ok(true)` if a task was claimed (whatever its outcome),
/// `Ok(false)` if the queue had nothing runnable. Exposed so tests can
/// drive the loop deterministically.
pub async fn process_next_task(ctx: &WorkerContext) -> Result<bool> {
    let Some(task) = ctx.queue.claim_next().await? else {
        return Ok(false);
    };

    // Respect the platform request ceiling before starting.
    let waited = ctx.limiter.acquire().await;
    if waited > Duration::ZERO {
        debug!(task_id = %task.id, waited = ?waited, "Task start was rate limited");
    }

    if let Err(e) = process_task(ctx, &task).await {
        error!(task_id = %task.id, "Task processing error: {}", e);
    }
    Ok(true)
}

async fn process_task(ctx: &WorkerContext, task: &QueueTaskDbModel) -> Result<()> {
    let payload: TaskPayload = match serde_json::from_str(&task.payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(task_id = %task.id, "Dropping task with unparseable payload: {}", e);
            ctx.queue.complete(&task.id).await?;
            return Ok(());
        }
    };

    let job = match ctx.jobs.get_job(&payload.job_id).await {
        Ok(job) => job,
        Err(Error::NotFound { .. }) => {
            warn!(task_id = %task.id, job_id = %payload.job_id, "Task references missing job");
            ctx.queue.complete(&task.id).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // A cancel request may have finished the job while the task sat queued.
    if job.get_status().is_some_and(|s| s.is_terminal()) {
        debug!(job_id = %job.id, status = %job.status, "Job already terminal, dropping task");
        ctx.queue.complete(&task.id).await?;
        return Ok(());
    }

    // Checkpoint zero: cancelled before execution even starts.
    if ctx.cancellation.is_set(&job.id).await? {
        finish_cancelled(ctx, &job, task, None).await?;
        return Ok(());
    }

    let job = ctx
        .jobs
        .apply_update(&job.id, &JobUpdate::status(JobStatus::Processing))
        .await?;
    info!(job_id = %job.id, task_id = %task.id, "Job processing");

    let credential = match ctx.credentials.select_for_platform(payload.platform).await {
        Ok(credential) => credential,
        Err(e) => {
            warn!(job_id = %job.id, "Credential acquisition failed: {}", e);
            finish_failed(ctx, &job, task, &e.to_string()).await?;
            return Ok(());
        }
    };

    let request = ScrapeRequest {
        job_id: job.id.clone(),
        platform: payload.platform,
        search_params: job.get_search_params()?,
    };

    // Cancellation token satisfied by polling the shared channel; the
    // backend checkpoints against the token at its natural pause points.
    let cancel_token = CancellationToken::new();
    let poller = spawn_cancel_poller(ctx, &job.id, cancel_token.clone());

    let started = Instant::now();
    let result = ctx
        .backend
        .execute(&request, &credential, cancel_token.clone())
        .await;
    poller.abort();
    let duration_seconds = started.elapsed().as_secs() as i64;

    match result {
        Err(e) if e.is_cancellation() => {
            // Distinguished outcome: no retry, no reliability penalty.
            finish_cancelled(ctx, &job, task, Some(&credential)).await?;
        }
        Ok(outcome) if outcome.success => {
            let (file_path, expires_at) =
                persist_result(ctx, &request, &outcome).await?;
            record_usage(
                ctx,
                &credential,
                &job,
                true,
                outcome.items.len() as i64,
                duration_seconds,
                None,
            )
            .await;

            let update = JobUpdate::status(JobStatus::Completed)
                .with_account(&credential.id)
                .with_result(outcome.items.len() as i64, file_path)
                .with_expires_at(expires_at);
            ctx.jobs.apply_update(&job.id, &update).await?;
            ctx.queue.complete(&task.id).await?;
            info!(
                job_id = %job.id,
                items = outcome.items.len(),
                duration_seconds,
                "Job completed"
            );
            aggregate_parent(ctx, &job).await;
        }
        Ok(outcome) => {
            // The backend failed mid-run but salvaged what it had; keep the
            // partial result and finish as failed without retrying.
            let error_message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "scrape reported failure".to_string());
            let mut update =
                JobUpdate::status(JobStatus::Failed).with_account(&credential.id);
            if !outcome.items.is_empty() {
                let (file_path, expires_at) =
                    persist_result(ctx, &request, &outcome).await?;
                update = update
                    .with_result(outcome.items.len() as i64, file_path)
                    .with_expires_at(expires_at);
            }
            record_usage(
                ctx,
                &credential,
                &job,
                false,
                outcome.items.len() as i64,
                duration_seconds,
                Some(&error_message),
            )
            .await;

            ctx.jobs.apply_update(&job.id, &update).await?;
            ctx.queue.complete(&task.id).await?;
            warn!(job_id = %job.id, error = %error_message, "Job failed with partial result");
            aggregate_parent(ctx, &job).await;
        }
        Err(e) => {
            // Transient backend failure: the queue decides whether the
            // attempt budget allows another delivery.
            record_usage(
                ctx,
                &credential,
                &job,
                false,
                0,
                duration_seconds,
                Some(&e.to_string()),
            )
            .await;

            if ctx.queue.retry(task).await? {
                let update = JobUpdate::status(JobStatus::Waiting).with_account(&credential.id);
                ctx.jobs.apply_update(&job.id, &update).await?;
                warn!(job_id = %job.id, "Job requeued after backend error: {}", e);
            } else {
                finish_failed(ctx, &job, task, &e.to_string()).await?;
            }
        }
    }

    Ok(())
}

fn spawn_cancel_poller(
    ctx: &WorkerContext,
    job_id: &str,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let channel = ctx.cancellation.clone();
    let job_id = job_id.to_string();
    tokio::spawn(async move {
        loop {
            match channel.is_set(&job_id).await {
                Ok(true) => {
                    info!(job_id = %job_id, "Cancellation flag observed");
                    token.cancel();
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, "Cancellation check failed: {}", e),
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    })
}

async fn persist_result(
    ctx: &WorkerContext,
    request: &ScrapeRequest,
    outcome: &ScrapeOutcome,
) -> Result<(String, String)> {
    let file_name = result_file_name(request.platform, &request.search_params);
    let file_path = ctx
        .results
        .save(request.platform, &file_name, &outcome.items)
        .await?;
    let expires_at = (Utc::now() + Days::new(ctx.result_retention_days)).to_rfc3339();
    Ok((file_path, expires_at))
}

async fn record_usage(
    ctx: &WorkerContext,
    credential: &CredentialDbModel,
    job: &JobDbModel,
    success: bool,
    items_scraped: i64,
    duration_seconds: i64,
    error_message: Option<&str>,
) {
    let mut record = UsageRecordDbModel::new(
        &credential.id,
        &job.id,
        success,
        items_scraped,
        duration_seconds,
    );
    if let Some(message) = error_message {
        record = record.with_error(message);
    }
    if let Err(e) = ctx.credentials.record_usage(&record).await {
        error!(job_id = %job.id, credential_id = %credential.id, "Failed to record usage: {}", e);
    }
}

async fn finish_cancelled(
    ctx: &WorkerContext,
    job: &JobDbModel,
    task: &QueueTaskDbModel,
    credential: Option<&CredentialDbModel>,
) -> Result<()> {
    let mut update = JobUpdate::status(JobStatus::Cancelled);
    if let Some(credential) = credential {
        update = update.with_account(&credential.id);
    }
    ctx.jobs.apply_update(&job.id, &update).await?;
    ctx.queue.complete(&task.id).await?;
    let _ = ctx.cancellation.clear(&job.id).await;
    info!(job_id = %job.id, "Job cancelled");
    aggregate_parent(ctx, job).await;
    Ok(())
}

async fn finish_failed(
    ctx: &WorkerContext,
    job: &JobDbModel,
    task: &QueueTaskDbModel,
    error_message: &str,
) -> Result<()> {
    ctx.jobs
        .apply_update(&job.id, &JobUpdate::status(JobStatus::Failed))
        .await?;
    ctx.queue.complete(&task.id).await?;
    warn!(job_id = %job.id, error = %error_message, "Job failed");
    aggregate_parent(ctx, job).await;
    Ok(())
}

/// Recompute the parent's status after a child termination. Aggregation
/// errors are logged and never block the leaf's own terminal state.
async fn aggregate_parent(ctx: &WorkerContext, job: &JobDbModel) {
    let Some(parent_id) = &job.parent_id else {
        return;
    };
    let today = Utc::now().date_naive();
    if let Err(e) = ctx.aggregator.aggregate_parent(parent_id, today).await {
        error!(parent_id = %parent_id, "Parent aggregation failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 2);
    }

    #[test]
    fn test_worker_pool_lifecycle_flags() {
        let pool = WorkerPool::new();
        assert!(pool.is_running());
    }
}
