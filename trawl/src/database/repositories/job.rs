//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobStatus, JobUpdate};
use crate::database::time;
use crate::{Error, Result};

/// Filters for top-level job listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<JobStatus>,
    pub platform: Option<String>,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;

    /// Apply a partial update, validating the status transition and
    /// stamping `started_at`/`completed_at` server-side.
    async fn apply_update(&self, id: &str, update: &JobUpdate) -> Result<JobDbModel>;

    async fn get_children(&self, parent_id: &str) -> Result<Vec<JobDbModel>>;

    /// Status histogram of a parent's children, as `(status, count)` rows.
    async fn children_status_counts(&self, parent_id: &str) -> Result<Vec<(String, i64)>>;

    /// Recurring parents that may still need a child for today's tick.
    async fn list_recurring_parents(&self) -> Result<Vec<JobDbModel>>;

    /// Check whether a child covering the given day already exists under
    /// this parent (recurrence-tick idempotence key).
    async fn child_exists_for_date(&self, parent_id: &str, date_from: &str) -> Result<bool>;

    /// Jobs whose result file retention has expired and is not yet deleted.
    async fn list_expired_file_jobs(&self, now: &str) -> Result<Vec<JobDbModel>>;

    async fn mark_file_deleted(&self, id: &str) -> Result<()>;

    /// Top-level jobs (parents and singletons), newest first.
    async fn list_top_level(
        &self,
        filters: &JobFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobDbModel>>;

    async fn count_top_level(&self, filters: &JobFilters) -> Result<i64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (
                id, queue_task_id, platform, is_parent, parent_id, is_recurring,
                recur_until, search_params, status, account_id, result_count,
                file_path, created_at, started_at, completed_at, expires_at, file_deleted
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue_task_id)
        .bind(&job.platform)
        .bind(job.is_parent)
        .bind(&job.parent_id)
        .bind(job.is_recurring)
        .bind(&job.recur_until)
        .bind(&job.search_params)
        .bind(&job.status)
        .bind(&job.account_id)
        .bind(job.result_count)
        .bind(&job.file_path)
        .bind(&job.created_at)
        .bind(&job.started_at)
        .bind(&job.completed_at)
        .bind(&job.expires_at)
        .bind(job.file_deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn apply_update(&self, id: &str, update: &JobUpdate) -> Result<JobDbModel> {
        if update.is_empty() {
            return self.get_job(id).await;
        }

        let current = self.get_job(id).await?;

        let mut started_at_stamp: Option<String> = None;
        let mut completed_at_stamp: Option<String> = None;

        if let Some(next) = update.status {
            let from = current
                .get_status()
                .ok_or_else(|| Error::Database(format!("invalid stored status: {}", current.status)))?;
            if !from.can_transition_to(next) {
                return Err(Error::InvalidStateTransition {
                    from: from.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }

            if next == JobStatus::Processing && current.started_at.is_none() {
                started_at_stamp = Some(time::now_rfc3339());
            }

            // Terminal writes stamp completed_at; partial_failure counts as
            // terminal only for non-recurring parents.
            let stamps_completed = next.is_terminal()
                || (next == JobStatus::PartialFailure && !current.is_recurring);
            if stamps_completed && current.completed_at.is_none() {
                completed_at_stamp = Some(time::now_rfc3339());
            }
        }

        sqlx::query(
            r#"
            UPDATE job SET
                status = COALESCE(?, status),
                account_id = COALESCE(?, account_id),
                result_count = COALESCE(?, result_count),
                file_path = COALESCE(file_path, ?),
                expires_at = COALESCE(?, expires_at),
                queue_task_id = COALESCE(?, queue_task_id),
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.account_id)
        .bind(update.result_count)
        .bind(&update.file_path)
        .bind(&update.expires_at)
        .bind(&update.queue_task_id)
        .bind(&started_at_stamp)
        .bind(&completed_at_stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_job(id).await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE parent_id = ? ORDER BY created_at",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn children_status_counts(&self, parent_id: &str) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM job WHERE parent_id = ? GROUP BY status",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_recurring_parents(&self) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE is_recurring = 1 AND status IN ('scheduled', 'partial_failure')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn child_exists_for_date(&self, parent_id: &str, date_from: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM job
            WHERE parent_id = ? AND json_extract(search_params, '$.date_from') = ?
            LIMIT 1
            "#,
        )
        .bind(parent_id)
        .bind(date_from)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_expired_file_jobs(&self, now: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE expires_at IS NOT NULL AND expires_at <= ?
              AND file_path IS NOT NULL
              AND file_deleted = 0
              AND status IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_file_deleted(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE job SET file_deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_top_level(
        &self,
        filters: &JobFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobDbModel>> {
        let mut sql = String::from(
            "SELECT * FROM job WHERE (is_parent = 1 OR parent_id IS NULL)",
        );
        if filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filters.platform.is_some() {
            sql.push_str(" AND platform = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, JobDbModel>(&sql);
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(platform) = &filters.platform {
            query = query.bind(platform.clone());
        }
        let jobs = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn count_top_level(&self, filters: &JobFilters) -> Result<i64> {
        let mut sql = String::from(
            "SELECT COUNT(*) FROM job WHERE (is_parent = 1 OR parent_id IS NULL)",
        );
        if filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filters.platform.is_some() {
            sql.push_str(" AND platform = ?");
        }

        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(platform) = &filters.platform {
            query = query.bind(platform.clone());
        }
        let (count,) = query.fetch_one(&self.pool).await?;
        Ok(count)
    }
}
