//! Recurrence scheduler.
//!
//! A daily tick that materializes the next child job for every still-open
//! recurring parent, retires recurring parents past their end date, resets
//! the per-account daily counters, and triggers the cleanup service.
//!
//! The tick is idempotent: it may run more than once per day without
//! creating duplicate children, because child creation is keyed on the
//! day the child covers.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cleanup::CleanupService;
use crate::database::models::{JobDbModel, JobStatus, JobUpdate};
use crate::database::repositories::{CredentialRepository, JobRepository};
use crate::database::time;
use crate::submission::SubmissionService;
use crate::{Error, Result};

/// Default tick time: 03:05 every day (`sec min hour dom month dow`).
pub const DEFAULT_TICK_CRON: &str = "0 5 3 * * *";

/// Configuration for the recurrence scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cron expression for the daily tick, in UTC.
    pub tick_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_cron: DEFAULT_TICK_CRON.to_string(),
        }
    }
}

/// The recurrence scheduler.
pub struct RecurrenceScheduler {
    schedule: Schedule,
    jobs: Arc<dyn JobRepository>,
    credentials: Arc<dyn CredentialRepository>,
    submission: Arc<SubmissionService>,
    cleanup: Arc<CleanupService>,
    cancellation_token: CancellationToken,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecurrenceScheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<dyn JobRepository>,
        credentials: Arc<dyn CredentialRepository>,
        submission: Arc<SubmissionService>,
        cleanup: Arc<CleanupService>,
    ) -> Result<Self> {
        // Parse the expression up front so a bad config fails at startup.
        let schedule = Schedule::from_str(&config.tick_cron)
            .map_err(|e| Error::config(format!("invalid tick cron '{}': {e}", config.tick_cron)))?;
        Ok(Self {
            schedule,
            jobs,
            credentials,
            submission,
            cleanup,
            cancellation_token: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
        })
    }

    /// Start the tick loop.
    pub fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        let token = self.cancellation_token.clone();
        let schedule = self.schedule.clone();

        info!(cron = %self.schedule, "Recurrence scheduler started");

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    error!("Tick cron yields no future occurrence, scheduler stopping");
                    break;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                debug!(next = %next, "Sleeping until next recurrence tick");

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let today = Utc::now().date_naive();
                if let Err(e) = scheduler.tick(today).await {
                    error!("Recurrence tick failed: {}", e);
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the tick loop.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Recurrence scheduler stopped");
    }

    /// Run one tick for the given day. Public so tests (and operators) can
    /// trigger it on demand.
    pub async fn tick(&self, today: NaiveDate) -> Result<()> {
        let parents = self.jobs.list_recurring_parents().await?;
        if !parents.is_empty() {
            info!("Recurrence tick over {} active parents", parents.len());
        }

        for parent in &parents {
            // One parent's error must not starve the rest of the tick.
            if let Err(e) = self.tick_parent(parent, today).await {
                error!(parent_id = %parent.id, "Recurrence tick error: {}", e);
            }
        }

        match self.credentials.reset_daily_counts().await {
            Ok(reset) => debug!("Reset daily use counters on {} credentials", reset),
            Err(e) => error!("Failed to reset daily use counters: {}", e),
        }

        if let Err(e) = self.cleanup.run_cleanup().await {
            error!("Cleanup tick failed: {}", e);
        }

        Ok(())
    }

    async fn tick_parent(&self, parent: &JobDbModel, today: NaiveDate) -> Result<()> {
        let Some(recur_until) = parent.get_recur_until() else {
            return Err(Error::Database(format!(
                "recurring parent {} has no recur_until",
                parent.id
            )));
        };

        if today > recur_until {
            info!(
                parent_id = %parent.id,
                recur_until = %recur_until,
                "Recurring parent reached its end date, retiring"
            );
            self.jobs
                .apply_update(&parent.id, &JobUpdate::status(JobStatus::Completed))
                .await?;
            return Ok(());
        }

        // The tick materializes yesterday's window: [today - 1, today).
        let Some(target_day) = today.checked_sub_days(Days::new(1)) else {
            return Err(Error::Other("date underflow computing tick window".into()));
        };

        if self
            .jobs
            .child_exists_for_date(&parent.id, &time::date_str(target_day))
            .await?
        {
            debug!(
                parent_id = %parent.id,
                day = %target_day,
                "Child for this day already exists, skipping"
            );
            return Ok(());
        }

        let params = parent.get_search_params()?.with_window(target_day, today);
        let child_id = self.submission.enqueue_child_job(parent, &params).await?;
        info!(
            parent_id = %parent.id,
            child_id = %child_id,
            day = %target_day,
            "Created recurring child job"
        );
        Ok(())
    }
}
