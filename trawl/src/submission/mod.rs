//! Submission service.
//!
//! Validates a scraping request and decides what it becomes: a recurring
//! parent definition, a date-range split into per-day children, or a
//! singleton job. All job rows and queue entries are created here.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::models::{JobDbModel, Platform, SearchParams};
use crate::database::repositories::JobRepository;
use crate::queue::{DEFAULT_PRIORITY, TaskPayload, TaskQueue};
use crate::{Error, Result};

/// A scraping request as received from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub platform: Platform,
    pub keywords: Option<String>,
    pub exact_phrase: Option<String>,
    pub hashtags: Option<String>,
    pub author_filter: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub recurring: bool,
    pub recur_until: Option<NaiveDate>,
}

impl SubmissionRequest {
    /// A request with only the platform set; fields are filled per call.
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform,
            keywords: None,
            exact_phrase: None,
            hashtags: None,
            author_filter: None,
            date_from: None,
            date_to: None,
            limit: None,
            recurring: false,
            recur_until: None,
        }
    }

    fn search_params(&self) -> SearchParams {
        SearchParams {
            keywords: self.keywords.clone(),
            exact_phrase: self.exact_phrase.clone(),
            hashtags: self.hashtags.clone(),
            author_filter: self.author_filter.clone(),
            date_from: self.date_from,
            date_to: self.date_to,
            limit: Some(self.limit.unwrap_or(100)),
        }
    }
}

/// What a submission produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    /// The created top-level job (parent or singleton).
    pub job_id: String,
    /// Per-day children for ranged submissions, in window order.
    pub child_job_ids: Vec<String>,
}

/// Partition an inclusive date range into consecutive one-day windows
/// `[d, d+1)`, one per calendar day.
pub fn split_date_range(from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut day = from;
    while day <= to {
        let next = day + Days::new(1);
        windows.push((day, next));
        day = next;
    }
    windows
}

/// The submission service.
pub struct SubmissionService {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<TaskQueue>,
}

impl SubmissionService {
    pub fn new(jobs: Arc<dyn JobRepository>, queue: Arc<TaskQueue>) -> Self {
        Self { jobs, queue }
    }

    /// Validate and submit a scraping request.
    pub async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionOutcome> {
        self.submit_with_today(request, Utc::now().date_naive()).await
    }

    /// Submission with an explicit "today", so date validation is testable.
    pub async fn submit_with_today(
        &self,
        request: &SubmissionRequest,
        today: NaiveDate,
    ) -> Result<SubmissionOutcome> {
        let params = request.search_params();
        if !params.has_criterion() {
            return Err(Error::validation(
                "at least one search criterion is required (keywords, exact phrase, hashtags, or author)",
            ));
        }

        if request.date_from.is_some() != request.date_to.is_some() {
            return Err(Error::validation("both dates required or neither"));
        }

        if request.recurring {
            let Some(recur_until) = request.recur_until else {
                return Err(Error::validation(
                    "recurring submissions require an end date",
                ));
            };
            if recur_until < today {
                return Err(Error::validation("recurring end date cannot be in the past"));
            }
            return self.submit_recurring(request, &params, recur_until).await;
        }

        if let (Some(from), Some(to)) = (request.date_from, request.date_to) {
            // Callers occasionally swap the bounds; normalize instead of
            // rejecting.
            let (from, to) = if from <= to { (from, to) } else { (to, from) };
            return self.submit_ranged(request, &params, from, to).await;
        }

        self.submit_singleton(request, &params).await
    }

    async fn submit_recurring(
        &self,
        request: &SubmissionRequest,
        params: &SearchParams,
        recur_until: NaiveDate,
    ) -> Result<SubmissionOutcome> {
        let parent = JobDbModel::new_recurring_parent(request.platform, params, recur_until);
        self.jobs.create_job(&parent).await?;

        info!(
            job_id = %parent.id,
            platform = request.platform.as_str(),
            recur_until = %recur_until,
            "Created recurring parent; first child materializes on the next tick"
        );
        Ok(SubmissionOutcome {
            job_id: parent.id,
            child_job_ids: vec![],
        })
    }

    async fn submit_ranged(
        &self,
        request: &SubmissionRequest,
        params: &SearchParams,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<SubmissionOutcome> {
        let parent = JobDbModel::new_range_parent(request.platform, params);
        self.jobs.create_job(&parent).await?;

        let windows = split_date_range(from, to);
        let mut child_job_ids = Vec::with_capacity(windows.len());
        for (day, next) in windows {
            let child_params = params.with_window(day, next);
            let child_id = self
                .create_and_enqueue(request.platform, &child_params, Some(&parent))
                .await?;
            child_job_ids.push(child_id);
        }

        info!(
            job_id = %parent.id,
            children = child_job_ids.len(),
            "Ranged submission split into daily jobs"
        );
        Ok(SubmissionOutcome {
            job_id: parent.id,
            child_job_ids,
        })
    }

    async fn submit_singleton(
        &self,
        request: &SubmissionRequest,
        params: &SearchParams,
    ) -> Result<SubmissionOutcome> {
        let job_id = self
            .create_and_enqueue(request.platform, params, None)
            .await?;
        info!(job_id = %job_id, "Singleton submission enqueued");
        Ok(SubmissionOutcome {
            job_id,
            child_job_ids: vec![],
        })
    }

    /// Create and enqueue one child under an existing parent. Used by the
    /// recurrence scheduler when materializing the next day's job.
    pub async fn enqueue_child_job(
        &self,
        parent: &JobDbModel,
        params: &SearchParams,
    ) -> Result<String> {
        let platform = parent
            .get_platform()
            .ok_or_else(|| Error::Database(format!("invalid stored platform: {}", parent.platform)))?;
        self.create_and_enqueue(platform, params, Some(parent)).await
    }

    async fn create_and_enqueue(
        &self,
        platform: Platform,
        params: &SearchParams,
        parent: Option<&JobDbModel>,
    ) -> Result<String> {
        let mut job = match parent {
            Some(parent) => JobDbModel::new_child(&parent.id, platform, params),
            None => JobDbModel::new_singleton(platform, params),
        };
        let task_id = TaskQueue::make_task_id(platform);
        job.queue_task_id = Some(task_id.clone());
        self.jobs.create_job(&job).await?;

        let payload = TaskPayload {
            job_id: job.id.clone(),
            platform,
            search_params: params.clone(),
        };
        self.queue
            .enqueue(&task_id, &platform.task_kind(), &payload, DEFAULT_PRIORITY)
            .await?;
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_split_single_day() {
        let windows = split_date_range(day(2025, 7, 1), day(2025, 7, 1));
        assert_eq!(windows, vec![(day(2025, 7, 1), day(2025, 7, 2))]);
    }

    #[test]
    fn test_split_three_days() {
        let windows = split_date_range(day(2025, 7, 1), day(2025, 7, 3));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (day(2025, 7, 1), day(2025, 7, 2)));
        assert_eq!(windows[2], (day(2025, 7, 3), day(2025, 7, 4)));
    }

    #[test]
    fn test_split_windows_are_contiguous_and_cover_range() {
        let from = day(2025, 6, 25);
        let to = day(2025, 7, 5);
        let windows = split_date_range(from, to);

        // Count equals the day span.
        assert_eq!(windows.len() as i64, (to - from).num_days() + 1);

        // Contiguous, non-overlapping: each window ends where the next starts.
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }

        // Union is exactly [from, to + 1 day).
        assert_eq!(windows.first().unwrap().0, from);
        assert_eq!(windows.last().unwrap().1, to + Days::new(1));
    }

    #[test]
    fn test_split_crosses_month_boundary() {
        let windows = split_date_range(day(2025, 7, 31), day(2025, 8, 1));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], (day(2025, 7, 31), day(2025, 8, 1)));
        assert_eq!(windows[1], (day(2025, 8, 1), day(2025, 8, 2)));
    }
}
