//! Database-backed task queue.
//!
//! Decouples submission from execution: tasks are persisted rows claimed by
//! workers through a conditional update, with bounded retries and
//! exponential backoff on transient backend failures. Delivery is
//! at-least-once. Cancellation outcomes are never retried.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::database::models::{Platform, QueueTaskDbModel, SearchParams};
use crate::database::time;
use crate::Result;

/// Priority assigned to ordinary scraping submissions.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Configuration for the task queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum delivery attempts before a task is declared dead.
    pub max_attempts: i64,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 30,
        }
    }
}

/// Payload delivered to workers for scraping tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: String,
    pub platform: Platform,
    pub search_params: SearchParams,
}

/// The persistent task queue.
pub struct TaskQueue {
    pool: SqlitePool,
    config: QueueConfig,
    /// Notify when new tasks become runnable.
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    pub fn with_config(pool: SqlitePool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Notifier handle for workers waiting on new tasks.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Generate a unique task id: platform prefix, creation millis, and a
    /// random suffix so two submissions in the same instant never collide.
    pub fn make_task_id(platform: Platform) -> String {
        format!(
            "{}-{}-{}",
            platform.as_str(),
            Utc::now().timestamp_millis(),
            random_suffix()
        )
    }

    /// Enqueue a task under a caller-assigned id.
    pub async fn enqueue(
        &self,
        task_id: &str,
        kind: &str,
        payload: &TaskPayload,
        priority: i64,
    ) -> Result<String> {
        let task = QueueTaskDbModel::new(
            task_id,
            kind,
            serde_json::to_string(payload)?,
            self.config.max_attempts,
        )
        .with_priority(priority);

        sqlx::query(
            r#"
            INSERT INTO queue_task (
                id, kind, payload, status, priority, attempts, max_attempts,
                next_attempt_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.kind)
        .bind(&task.payload)
        .bind(&task.status)
        .bind(task.priority)
        .bind(task.attempts)
        .bind(task.max_attempts)
        .bind(&task.next_attempt_at)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .execute(&self.pool)
        .await?;

        info!(task_id = %task.id, kind = %task.kind, "Enqueued task");
        self.notify.notify_one();
        Ok(task.id)
    }

    /// Claim the next runnable pending task.
    ///
    /// The claim is a single conditional update so two workers can never
    /// own the same task; the attempt counter is incremented at claim time.
    pub async fn claim_next(&self) -> Result<Option<QueueTaskDbModel>> {
        let now = time::now_rfc3339();
        let task = sqlx::query_as::<_, QueueTaskDbModel>(
            r#"
            UPDATE queue_task SET
                status = 'running',
                attempts = attempts + 1,
                updated_at = ?
            WHERE id = (
                SELECT id FROM queue_task
                WHERE status = 'pending' AND next_attempt_at <= ?
                ORDER BY priority DESC, created_at
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Mark a task finished (success, terminal failure, or cancellation).
    pub async fn complete(&self, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE queue_task SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(time::now_rfc3339())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Requeue a task after a transient failure.
    ///
    /// Returns `true` if the task will run again, `false` if its attempt
    /// budget is exhausted and it was declared dead.
    pub async fn retry(&self, task: &QueueTaskDbModel) -> Result<bool> {
        if task.attempts >= task.max_attempts {
            sqlx::query("UPDATE queue_task SET status = 'dead', updated_at = ? WHERE id = ?")
                .bind(time::now_rfc3339())
                .bind(&task.id)
                .execute(&self.pool)
                .await?;
            warn!(task_id = %task.id, attempts = task.attempts, "Task exhausted retries");
            return Ok(false);
        }

        // Exponential backoff: base * 2^(attempts - 1).
        let exponent = (task.attempts - 1).clamp(0, 16) as u32;
        let delay_secs = self.config.backoff_base_secs.saturating_mul(1_i64 << exponent);
        let next_attempt_at = (Utc::now() + ChronoDuration::seconds(delay_secs)).to_rfc3339();

        sqlx::query(
            "UPDATE queue_task SET status = 'pending', next_attempt_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&next_attempt_at)
        .bind(time::now_rfc3339())
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        info!(
            task_id = %task.id,
            attempts = task.attempts,
            delay_secs,
            "Task requeued with backoff"
        );
        Ok(true)
    }

    /// Remove a task that has not started yet (cancellation of a waiting job).
    ///
    /// Returns `true` if a pending task was removed.
    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_task WHERE id = ? AND status = 'pending'")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reset tasks left `running` by a previous process (shutdown mid-wait
    /// or crash) back to `pending` so they are delivered again.
    pub async fn recover(&self) -> Result<i64> {
        let now = time::now_rfc3339();
        let result = sqlx::query(
            "UPDATE queue_task SET status = 'pending', next_attempt_at = ?, updated_at = ? WHERE status = 'running'",
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected() as i64;
        if count > 0 {
            info!("Recovered {} interrupted queue tasks", count);
            self.notify.notify_one();
        }
        Ok(count)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<QueueTaskDbModel>> {
        let task = sqlx::query_as::<_, QueueTaskDbModel>("SELECT * FROM queue_task WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    /// Number of tasks not yet finished.
    pub async fn depth(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_task WHERE status IN ('pending', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Nine base-36 characters, mirroring the reference id scheme.
fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut value = rand::random::<u64>();
    let mut out = String::with_capacity(9);
    for _ in 0..9 {
        out.push(ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    out
}
