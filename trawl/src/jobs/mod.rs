//! Job control service.
//!
//! Read access (lookup, filtered listing, child listing) and the
//! cancellation entry point. Cancelling a waiting job removes its queue
//! task directly; cancelling a processing job raises the cancellation
//! flag and lets the owning worker write the terminal status at its next
//! checkpoint. Cancelling a parent cascades over its active children.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregator::StatusAggregator;
use crate::cancellation::CancellationChannel;
use crate::database::models::{JobDbModel, JobStatus, JobUpdate};
use crate::database::repositories::{JobFilters, JobRepository};
use crate::queue::TaskQueue;
use crate::{Error, Result};

/// Default page size for job listing.
const DEFAULT_PAGE_SIZE: i64 = 20;

/// A page of top-level jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobDbModel>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// What a cancellation request did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// Waiting jobs finished directly.
    pub cancelled_now: usize,
    /// Processing jobs signalled through the cancellation channel.
    pub signalled: usize,
}

/// The job control service.
pub struct JobControlService {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<TaskQueue>,
    cancellation: Arc<dyn CancellationChannel>,
    aggregator: Arc<StatusAggregator>,
    cancel_ttl: Duration,
}

impl JobControlService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<TaskQueue>,
        cancellation: Arc<dyn CancellationChannel>,
        aggregator: Arc<StatusAggregator>,
        cancel_ttl: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            cancellation,
            aggregator,
            cancel_ttl,
        }
    }

    pub async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.jobs.get_job(id).await
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<JobDbModel>> {
        self.jobs.get_children(parent_id).await
    }

    /// List top-level jobs (parents and singletons), newest first.
    pub async fn list_jobs(
        &self,
        filters: &JobFilters,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<JobPage> {
        let page = page.max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);
        let offset = (page - 1) * page_size;

        let jobs = self.jobs.list_top_level(filters, page_size, offset).await?;
        let total = self.jobs.count_top_level(filters).await?;
        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
        })
    }

    /// Cancel a job.
    ///
    /// Parents cascade over their active children and are marked
    /// `cancelled` themselves; terminal jobs are rejected.
    pub async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let job = self.jobs.get_job(id).await?;
        let status = job
            .get_status()
            .ok_or_else(|| Error::Database(format!("invalid stored status: {}", job.status)))?;

        if job.is_parent {
            if status.is_terminal() {
                return Err(Error::validation(format!(
                    "cannot cancel a job in status \"{}\"",
                    status.as_str()
                )));
            }

            let mut outcome = CancelOutcome::default();
            for child in self.jobs.get_children(id).await? {
                let Some(child_status) = child.get_status() else {
                    continue;
                };
                if !child_status.is_active() {
                    continue;
                }
                match self.cancel_leaf(&child, child_status).await {
                    Ok(signalled) => {
                        if signalled {
                            outcome.signalled += 1;
                        } else {
                            outcome.cancelled_now += 1;
                        }
                    }
                    Err(e) => warn!(child_id = %child.id, "Failed to cancel child: {}", e),
                }
            }

            self.jobs
                .apply_update(id, &JobUpdate::status(JobStatus::Cancelled))
                .await?;
            info!(
                job_id = %id,
                cancelled_now = outcome.cancelled_now,
                signalled = outcome.signalled,
                "Parent job cancelled with cascade"
            );
            return Ok(outcome);
        }

        if !status.is_active() {
            return Err(Error::validation(format!(
                "cannot cancel a job in status \"{}\"",
                status.as_str()
            )));
        }

        let signalled = self.cancel_leaf(&job, status).await?;

        // A directly-finished child changes the parent's picture now; a
        // signalled one is aggregated by the worker when it observes the
        // flag.
        if !signalled && let Some(parent_id) = &job.parent_id {
            if let Err(e) = self
                .aggregator
                .aggregate_parent(parent_id, Utc::now().date_naive())
                .await
            {
                warn!(parent_id = %parent_id, "Parent aggregation after cancel failed: {}", e);
            }
        }

        Ok(CancelOutcome {
            cancelled_now: usize::from(!signalled),
            signalled: usize::from(signalled),
        })
    }

    /// Cancel one leaf job. Returns `true` if the job was signalled (still
    /// processing) rather than finished directly.
    async fn cancel_leaf(&self, job: &JobDbModel, status: JobStatus) -> Result<bool> {
        match status {
            JobStatus::Waiting => {
                if let Some(task_id) = &job.queue_task_id {
                    let removed = self.queue.remove(task_id).await?;
                    if !removed {
                        // The task was claimed between our read and the
                        // removal; raise the flag so the worker aborts.
                        self.cancellation.set(&job.id, self.cancel_ttl).await?;
                        return Ok(true);
                    }
                }
                self.jobs
                    .apply_update(&job.id, &JobUpdate::status(JobStatus::Cancelled))
                    .await?;
                info!(job_id = %job.id, "Waiting job cancelled");
                Ok(false)
            }
            JobStatus::Processing => {
                // The worker observes the flag at its next checkpoint and
                // writes the terminal status itself.
                self.cancellation.set(&job.id, self.cancel_ttl).await?;
                info!(job_id = %job.id, "Cancellation signalled to running job");
                Ok(true)
            }
            _ => Err(Error::validation(format!(
                "cannot cancel a job in status \"{}\"",
                status.as_str()
            ))),
        }
    }
}
