//! Service container for dependency injection.
//!
//! Holds the process-wide handles (pool, queue, cancellation channel) and
//! every service built on them. All handles are created once here and
//! passed explicitly; nothing reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::info;

use crate::aggregator::StatusAggregator;
use crate::cancellation::{CancellationChannel, InMemoryCancellationChannel};
use crate::cleanup::CleanupService;
use crate::config::AppConfig;
use crate::database::repositories::{
    CredentialRepository, JobRepository, SqlxCredentialRepository, SqlxJobRepository,
};
use crate::jobs::JobControlService;
use crate::queue::{QueueConfig, TaskQueue};
use crate::scheduler::{RecurrenceScheduler, SchedulerConfig};
use crate::scrape::{ResultStore, ScrapeBackend};
use crate::submission::SubmissionService;
use crate::worker::{
    RateLimiterConfig, WindowRateLimiter, WorkerContext, WorkerPool, WorkerPoolConfig,
};
use crate::Result;

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    /// Job repository.
    pub jobs: Arc<dyn JobRepository>,
    /// Credential repository.
    pub credentials: Arc<dyn CredentialRepository>,
    /// Task queue.
    pub queue: Arc<TaskQueue>,
    /// Cancellation channel.
    pub cancellation: Arc<dyn CancellationChannel>,
    /// Submission service.
    pub submission: Arc<SubmissionService>,
    /// Job control service (listing, cancellation).
    pub job_control: Arc<JobControlService>,
    /// Status aggregator.
    pub aggregator: Arc<StatusAggregator>,
    /// Cleanup service.
    pub cleanup: Arc<CleanupService>,
    /// Recurrence scheduler.
    pub scheduler: Arc<RecurrenceScheduler>,
    worker_pool: WorkerPool,
    worker_ctx: Arc<WorkerContext>,
}

impl ServiceContainer {
    /// Wire up all services against the given pool and scrape backend.
    pub fn new(
        pool: SqlitePool,
        config: &AppConfig,
        backend: Arc<dyn ScrapeBackend>,
    ) -> Result<Self> {
        info!("Initializing service container");

        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));
        let credentials: Arc<dyn CredentialRepository> =
            Arc::new(SqlxCredentialRepository::new(pool.clone()));

        let queue = Arc::new(TaskQueue::with_config(
            pool.clone(),
            QueueConfig {
                max_attempts: config.queue_max_attempts,
                backoff_base_secs: config.queue_backoff_base_secs,
            },
        ));
        let cancellation: Arc<dyn CancellationChannel> =
            Arc::new(InMemoryCancellationChannel::new());
        let results = Arc::new(ResultStore::new(config.results_dir.clone()));
        let limiter = Arc::new(WindowRateLimiter::new(RateLimiterConfig {
            max_starts: config.rate_limit_max_starts,
            window: Duration::from_secs(config.rate_limit_window_secs),
        }));

        let submission = Arc::new(SubmissionService::new(jobs.clone(), queue.clone()));
        let aggregator = Arc::new(StatusAggregator::new(jobs.clone()));
        let cleanup = Arc::new(CleanupService::new(jobs.clone(), results.clone()));
        let job_control = Arc::new(JobControlService::new(
            jobs.clone(),
            queue.clone(),
            cancellation.clone(),
            aggregator.clone(),
            Duration::from_secs(config.cancel_ttl_secs),
        ));

        let scheduler = Arc::new(RecurrenceScheduler::new(
            SchedulerConfig {
                tick_cron: config.tick_cron.clone(),
            },
            jobs.clone(),
            credentials.clone(),
            submission.clone(),
            cleanup.clone(),
        )?);

        let worker_ctx = Arc::new(WorkerContext {
            jobs: jobs.clone(),
            credentials: credentials.clone(),
            queue: queue.clone(),
            cancellation: cancellation.clone(),
            backend,
            results,
            limiter,
            aggregator: aggregator.clone(),
            result_retention_days: config.result_retention_days,
        });
        let worker_pool = WorkerPool::with_config(WorkerPoolConfig {
            max_workers: config.worker_count,
            ..Default::default()
        });

        info!("Service container initialized");

        Ok(Self {
            pool,
            jobs,
            credentials,
            queue,
            cancellation,
            submission,
            job_control,
            aggregator,
            cleanup,
            scheduler,
            worker_pool,
            worker_ctx,
        })
    }

    /// Shared worker handles (also used by tests to drive the execution
    /// loop deterministically).
    pub fn worker_context(&self) -> Arc<WorkerContext> {
        self.worker_ctx.clone()
    }

    /// Recover interrupted work and start the worker pool and scheduler.
    pub async fn start(&self) -> Result<()> {
        self.queue.recover().await?;
        self.worker_pool.start(self.worker_ctx.clone());
        self.scheduler.clone().start();
        Ok(())
    }

    /// Graceful shutdown: drain workers, stop the scheduler, close the pool.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.worker_pool.stop().await;
        self.scheduler.stop().await;
        self.pool.close().await;
        info!("Shutdown complete");
    }
}
