//! Queue task database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Queue task status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Runnable once `next_attempt_at` has passed.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Finished (successfully, cancelled, or terminally failed).
    Done,
    /// Exhausted its retry budget.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A persisted queue task.
///
/// Task ids are assigned by the queue (time-based plus random suffix) so
/// two submissions never collide.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueTaskDbModel {
    pub id: String,
    /// Job kind tag, e.g. `bluesky-scraping`.
    pub kind: String,
    /// JSON payload delivered to the worker.
    pub payload: String,
    pub status: String,
    /// Higher is more urgent.
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    /// Earliest instant the task may be claimed (backoff target).
    pub next_attempt_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl QueueTaskDbModel {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: impl Into<String>,
        max_attempts: i64,
    ) -> Self {
        let now = time::now_rfc3339();
        Self {
            id: id.into(),
            kind: kind.into(),
            payload: payload.into(),
            status: TaskStatus::Pending.as_str().to_string(),
            priority: 0,
            attempts: 0,
            max_attempts,
            next_attempt_at: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn get_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_runnable() {
        let task = QueueTaskDbModel::new("t1", "bluesky-scraping", "{}", 3);
        assert_eq!(task.get_status(), Some(TaskStatus::Pending));
        assert_eq!(task.attempts, 0);
        assert!(task.next_attempt_at <= time::now_rfc3339());
    }
}
