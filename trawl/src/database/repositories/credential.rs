//! Credential repository.
//!
//! Implements the rotation policy: least-recently-used first, reliability
//! as the tie-break, so load spreads across accounts while favouring the
//! ones that keep working.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use crate::database::models::{CredentialDbModel, Platform, UsageRecordDbModel};
use crate::database::time;
use crate::{Error, Result};

/// Credential repository trait.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Select the best credential for a platform: active accounts ordered
    /// by earliest `last_used_at` (never-used first), ties broken by
    /// highest `success_rate`.
    ///
    /// There is no atomic claim step: two workers selecting concurrently
    /// can receive the same account. Acceptable while the worker
    /// concurrency bound stays at or below the per-platform account count;
    /// a hardened version would claim with a conditional update.
    async fn select_for_platform(&self, platform: Platform) -> Result<CredentialDbModel>;

    /// Record one use: inserts the immutable usage row and folds the
    /// outcome into the credential's counters and running success rate,
    /// atomically.
    async fn record_usage(&self, record: &UsageRecordDbModel) -> Result<()>;

    async fn create(&self, credential: &CredentialDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<CredentialDbModel>;
    async fn list_for_platform(&self, platform: Platform) -> Result<Vec<CredentialDbModel>>;
    async fn set_active(&self, id: &str, is_active: bool) -> Result<()>;

    /// Reset `daily_use_count` across all credentials (daily tick).
    async fn reset_daily_counts(&self) -> Result<i64>;
}

/// SQLx implementation of CredentialRepository.
pub struct SqlxCredentialRepository {
    pool: SqlitePool,
}

impl SqlxCredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepository for SqlxCredentialRepository {
    async fn select_for_platform(&self, platform: Platform) -> Result<CredentialDbModel> {
        // SQLite sorts NULL first under ASC, so never-used accounts win.
        let credential = sqlx::query_as::<_, CredentialDbModel>(
            r#"
            SELECT * FROM credential
            WHERE platform = ? AND is_active = 1
            ORDER BY last_used_at ASC, success_rate DESC
            LIMIT 1
            "#,
        )
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            Error::ResourceExhausted(format!(
                "no active credential for platform {}",
                platform.as_str()
            ))
        })?;

        debug!(
            platform = platform.as_str(),
            username = %credential.username,
            "Selected credential"
        );
        Ok(credential)
    }

    async fn record_usage(&self, record: &UsageRecordDbModel) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_record (
                id, credential_id, job_id, success, error_message,
                items_scraped, duration_seconds, recorded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.credential_id)
        .bind(&record.job_id)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(record.items_scraped)
        .bind(record.duration_seconds)
        .bind(&record.recorded_at)
        .execute(&mut *tx)
        .await?;

        // success_rate is only ever recomputed through this weighted
        // average; use_count in the expression is the pre-increment value.
        let outcome = if record.success { 1.0_f64 } else { 0.0_f64 };
        sqlx::query(
            r#"
            UPDATE credential SET
                last_used_at = ?,
                use_count = use_count + 1,
                daily_use_count = daily_use_count + 1,
                success_rate = CASE
                    WHEN use_count = 0 THEN ?
                    ELSE (success_rate * use_count + ?) / (use_count + 1)
                END
            WHERE id = ?
            "#,
        )
        .bind(time::now_rfc3339())
        .bind(outcome)
        .bind(outcome)
        .bind(&record.credential_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create(&self, credential: &CredentialDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credential (
                id, platform, username, secret, is_active,
                last_used_at, use_count, daily_use_count, success_rate
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.platform)
        .bind(&credential.username)
        .bind(&credential.secret)
        .bind(credential.is_active)
        .bind(&credential.last_used_at)
        .bind(credential.use_count)
        .bind(credential.daily_use_count)
        .bind(credential.success_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<CredentialDbModel> {
        sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credential WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Credential", id))
    }

    async fn list_for_platform(&self, platform: Platform) -> Result<Vec<CredentialDbModel>> {
        let credentials = sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credential WHERE platform = ? ORDER BY username",
        )
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    async fn set_active(&self, id: &str, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE credential SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_daily_counts(&self) -> Result<i64> {
        let result = sqlx::query("UPDATE credential SET daily_use_count = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as i64)
    }
}
