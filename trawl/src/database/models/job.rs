//! Job database models.
//!
//! A job is the unit of scraping work tracked end-to-end: singleton jobs
//! execute directly, parent jobs group per-day children, recurring parents
//! spawn one child per scheduler tick until their end date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Supported scraping platforms.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bluesky,
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bluesky => "bluesky",
            Self::Twitter => "twitter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bluesky" => Some(Self::Bluesky),
            "twitter" => Some(Self::Twitter),
            _ => None,
        }
    }

    /// Queue task kind for this platform (one configured kind per platform).
    pub fn task_kind(&self) -> String {
        format!("{}-scraping", self.as_str())
    }
}

/// Job status values.
///
/// Leaf jobs move `waiting -> processing -> {completed|failed|cancelled}`.
/// Parent statuses are written exclusively by the status aggregator, except
/// the initial `processing`/`scheduled` set at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recurring parent awaiting its next child.
    Scheduled,
    /// Enqueued, not yet picked up by a worker.
    Waiting,
    /// A worker owns the job (or, for a parent, children are still active).
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully after exhausting retries.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
    /// Parent-only: mixed child outcomes.
    PartialFailure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::PartialFailure => "partial_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "partial_failure" => Some(Self::PartialFailure),
            _ => None,
        }
    }

    /// Check if this is a terminal status for a leaf job.
    ///
    /// `partial_failure` is not terminal: a recurring parent in that
    /// state keeps receiving children until its end date.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if a job in this status still has work ahead of it.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Processing)
    }

    /// Validate a status transition.
    ///
    /// Every status writer goes through this single function; terminal
    /// leaf statuses are absorbing. `processing -> waiting` is allowed for
    /// queue-level requeue after a transient backend failure.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Scheduled => matches!(next, Completed | Cancelled | PartialFailure),
            Waiting => matches!(next, Processing | Cancelled | Failed),
            Processing => matches!(
                next,
                Waiting | Completed | Failed | Cancelled | PartialFailure
            ),
            PartialFailure => matches!(next, Scheduled | Completed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

/// Search specification carried by every job.
///
/// Child jobs share the parent's criteria with their own one-day window
/// substituted into `date_from`/`date_to`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl SearchParams {
    /// Check that at least one search criterion is present.
    pub fn has_criterion(&self) -> bool {
        self.keywords.is_some()
            || self.exact_phrase.is_some()
            || self.hashtags.is_some()
            || self.author_filter.is_some()
    }

    /// Clone these params with a narrowed date window substituted.
    pub fn with_window(&self, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            date_from: Some(from),
            date_to: Some(to),
            ..self.clone()
        }
    }

    /// Effective result limit (the reference default is 100).
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(100)
    }
}

/// Job database model.
///
/// This is the canonical at-rest schema; every field maps 1:1 to a column
/// of the `job` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Task id in the queue; null until enqueued (parents are never enqueued).
    pub queue_task_id: Option<String>,
    pub platform: String,
    pub is_parent: bool,
    pub parent_id: Option<String>,
    pub is_recurring: bool,
    /// End date for recurring parents (`YYYY-MM-DD`), immutable after creation.
    pub recur_until: Option<String>,
    /// JSON blob of [`SearchParams`].
    pub search_params: String,
    pub status: String,
    /// Credential used for the execution, set by the worker.
    pub account_id: Option<String>,
    pub result_count: Option<i64>,
    /// Result artifact path, set at most once at (partial) completion.
    pub file_path: Option<String>,
    /// RFC 3339 timestamps.
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub expires_at: Option<String>,
    pub file_deleted: bool,
}

impl JobDbModel {
    fn base(platform: Platform, params: &SearchParams, status: JobStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_task_id: None,
            platform: platform.as_str().to_string(),
            is_parent: false,
            parent_id: None,
            is_recurring: false,
            recur_until: None,
            search_params: serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string()),
            status: status.as_str().to_string(),
            account_id: None,
            result_count: None,
            file_path: None,
            created_at: time::now_rfc3339(),
            started_at: None,
            completed_at: None,
            expires_at: None,
            file_deleted: false,
        }
    }

    /// A singleton job, executed directly.
    pub fn new_singleton(platform: Platform, params: &SearchParams) -> Self {
        Self::base(platform, params, JobStatus::Waiting)
    }

    /// A non-recurring parent grouping per-day children.
    pub fn new_range_parent(platform: Platform, params: &SearchParams) -> Self {
        let mut job = Self::base(platform, params, JobStatus::Processing);
        job.is_parent = true;
        job
    }

    /// A recurring parent; never executes, spawns one child per tick.
    pub fn new_recurring_parent(
        platform: Platform,
        params: &SearchParams,
        recur_until: NaiveDate,
    ) -> Self {
        let mut job = Self::base(platform, params, JobStatus::Scheduled);
        job.is_parent = true;
        job.is_recurring = true;
        job.recur_until = Some(time::date_str(recur_until));
        job
    }

    /// A child job owned by a parent, covering a one-day window.
    pub fn new_child(parent_id: &str, platform: Platform, params: &SearchParams) -> Self {
        let mut job = Self::base(platform, params, JobStatus::Waiting);
        job.parent_id = Some(parent_id.to_string());
        job
    }

    pub fn get_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn get_platform(&self) -> Option<Platform> {
        Platform::parse(&self.platform)
    }

    pub fn get_search_params(&self) -> crate::Result<SearchParams> {
        Ok(serde_json::from_str(&self.search_params)?)
    }

    pub fn get_recur_until(&self) -> Option<NaiveDate> {
        self.recur_until.as_deref().and_then(time::parse_date)
    }
}

/// Partial field set for a job status update.
///
/// Absent fields are left untouched. `processing` and terminal transitions
/// stamp `started_at`/`completed_at` server-side, so callers never supply
/// their own clock.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub account_id: Option<String>,
    pub result_count: Option<i64>,
    pub file_path: Option<String>,
    pub expires_at: Option<String>,
    pub queue_task_id: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_result(mut self, count: i64, file_path: impl Into<String>) -> Self {
        self.result_count = Some(count);
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: impl Into<String>) -> Self {
        self.expires_at = Some(expires_at.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.account_id.is_none()
            && self.result_count.is_none()
            && self.file_path.is_none()
            && self.expires_at.is_none()
            && self.queue_task_id.is_none()
    }
}
