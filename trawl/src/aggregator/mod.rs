//! Status aggregator.
//!
//! Derives a parent job's status purely from the distribution of its
//! children's statuses. Invoked after every child termination; because it
//! always recomputes from a fresh read of all children it is idempotent
//! and convergent under concurrent invocation (last writer wins).

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::database::models::{JobStatus, JobUpdate};
use crate::database::repositories::JobRepository;
use crate::Result;

/// Status histogram of one parent's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildStatusCounts {
    pub waiting: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl ChildStatusCounts {
    pub fn from_rows(rows: &[(String, i64)]) -> Self {
        let mut counts = Self::default();
        for (status, count) in rows {
            match JobStatus::parse(status) {
                Some(JobStatus::Waiting) => counts.waiting += count,
                Some(JobStatus::Processing) => counts.processing += count,
                Some(JobStatus::Completed) => counts.completed += count,
                Some(JobStatus::Failed) => counts.failed += count,
                Some(JobStatus::Cancelled) => counts.cancelled += count,
                // Parents are never children; scheduled/partial_failure
                // should not appear here.
                _ => {}
            }
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.waiting + self.processing + self.completed + self.failed + self.cancelled
    }

    pub fn active(&self) -> i64 {
        self.waiting + self.processing
    }
}

/// Compute a parent's status from its children's statuses.
///
/// Pure function of the inputs; returns `None` when there is nothing to
/// aggregate yet (zero children).
///
/// Recurring parents are never marked `completed` before their end date,
/// even if every child so far succeeded: the next tick will add another
/// child.
pub fn aggregate(
    counts: &ChildStatusCounts,
    recur_until: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<JobStatus> {
    if counts.total() == 0 {
        return None;
    }

    if let Some(until) = recur_until {
        // Recurring parent.
        if today > until {
            return Some(JobStatus::Completed);
        }
        if counts.active() > 0 {
            return Some(JobStatus::Scheduled);
        }
        if counts.failed > 0 || counts.cancelled > 0 {
            return Some(JobStatus::PartialFailure);
        }
        return Some(JobStatus::Scheduled);
    }

    // Non-recurring parent.
    if counts.active() > 0 {
        return Some(JobStatus::Processing);
    }
    let total = counts.total();
    if counts.completed == total {
        Some(JobStatus::Completed)
    } else if counts.cancelled == total {
        Some(JobStatus::Cancelled)
    } else if counts.failed == total {
        Some(JobStatus::Failed)
    } else {
        // Mixed terminal outcomes.
        Some(JobStatus::PartialFailure)
    }
}

/// Service wrapper applying the pure aggregation against the job store.
pub struct StatusAggregator {
    jobs: Arc<dyn JobRepository>,
}

impl StatusAggregator {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }

    /// Recompute and persist a parent's status. Returns the status written,
    /// or `None` when the parent has no children yet.
    pub async fn aggregate_parent(
        &self,
        parent_id: &str,
        today: NaiveDate,
    ) -> Result<Option<JobStatus>> {
        let parent = self.jobs.get_job(parent_id).await?;

        // A terminal parent (e.g. cancelled with cascade) never moves
        // backward, regardless of late-arriving child outcomes.
        if let Some(current) = parent.get_status()
            && current.is_terminal()
        {
            return Ok(Some(current));
        }

        let recur_until = if parent.is_recurring {
            parent.get_recur_until()
        } else {
            None
        };

        let rows = self.jobs.children_status_counts(parent_id).await?;
        let counts = ChildStatusCounts::from_rows(&rows);

        let Some(next) = aggregate(&counts, recur_until, today) else {
            debug!(parent_id, "Parent has no children, keeping current status");
            return Ok(None);
        };

        if parent.get_status() == Some(next) {
            return Ok(Some(next));
        }

        self.jobs
            .apply_update(parent_id, &JobUpdate::status(next))
            .await?;
        info!(
            parent_id,
            status = next.as_str(),
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            active = counts.active(),
            "Parent status aggregated"
        );
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn counts(
        waiting: i64,
        processing: i64,
        completed: i64,
        failed: i64,
        cancelled: i64,
    ) -> ChildStatusCounts {
        ChildStatusCounts {
            waiting,
            processing,
            completed,
            failed,
            cancelled,
        }
    }

    const TODAY: fn() -> NaiveDate = || day(2025, 7, 15);

    #[test]
    fn test_zero_children_is_noop() {
        assert_eq!(aggregate(&counts(0, 0, 0, 0, 0), None, TODAY()), None);
    }

    #[test]
    fn test_non_recurring_active_children() {
        assert_eq!(
            aggregate(&counts(1, 0, 2, 0, 0), None, TODAY()),
            Some(JobStatus::Processing)
        );
        assert_eq!(
            aggregate(&counts(0, 1, 0, 1, 0), None, TODAY()),
            Some(JobStatus::Processing)
        );
    }

    #[test]
    fn test_non_recurring_uniform_outcomes() {
        assert_eq!(
            aggregate(&counts(0, 0, 3, 0, 0), None, TODAY()),
            Some(JobStatus::Completed)
        );
        assert_eq!(
            aggregate(&counts(0, 0, 0, 3, 0), None, TODAY()),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            aggregate(&counts(0, 0, 0, 0, 3), None, TODAY()),
            Some(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_non_recurring_mixed_outcomes() {
        // completed + failed
        assert_eq!(
            aggregate(&counts(0, 0, 2, 1, 0), None, TODAY()),
            Some(JobStatus::PartialFailure)
        );
        // completed + cancelled
        assert_eq!(
            aggregate(&counts(0, 0, 2, 0, 1), None, TODAY()),
            Some(JobStatus::PartialFailure)
        );
        // failed + cancelled without any completed
        assert_eq!(
            aggregate(&counts(0, 0, 0, 1, 1), None, TODAY()),
            Some(JobStatus::PartialFailure)
        );
    }

    #[test]
    fn test_recurring_never_completes_before_end_date() {
        let until = day(2025, 8, 1);
        // All children so far completed, end date in the future.
        assert_eq!(
            aggregate(&counts(0, 0, 5, 0, 0), Some(until), TODAY()),
            Some(JobStatus::Scheduled)
        );
    }

    #[test]
    fn test_recurring_active_children_stay_scheduled() {
        let until = day(2025, 8, 1);
        assert_eq!(
            aggregate(&counts(1, 0, 2, 1, 0), Some(until), TODAY()),
            Some(JobStatus::Scheduled)
        );
    }

    #[test]
    fn test_recurring_partial_failure() {
        let until = day(2025, 8, 1);
        assert_eq!(
            aggregate(&counts(0, 0, 2, 1, 0), Some(until), TODAY()),
            Some(JobStatus::PartialFailure)
        );
        assert_eq!(
            aggregate(&counts(0, 0, 0, 0, 1), Some(until), TODAY()),
            Some(JobStatus::PartialFailure)
        );
    }

    #[test]
    fn test_recurring_past_end_date_forces_completed() {
        let until = day(2025, 7, 1);
        assert_eq!(
            aggregate(&counts(0, 0, 2, 1, 0), Some(until), TODAY()),
            Some(JobStatus::Completed)
        );
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let c = counts(0, 0, 2, 1, 0);
        let first = aggregate(&c, None, TODAY());
        let second = aggregate(&c, None, TODAY());
        assert_eq!(first, second);
    }

    #[test]
    fn test_counts_from_rows() {
        let rows = vec![
            ("completed".to_string(), 2),
            ("failed".to_string(), 1),
            ("waiting".to_string(), 3),
        ];
        let c = ChildStatusCounts::from_rows(&rows);
        assert_eq!(c.completed, 2);
        assert_eq!(c.failed, 1);
        assert_eq!(c.waiting, 3);
        assert_eq!(c.total(), 6);
        assert_eq!(c.active(), 3);
    }
}
