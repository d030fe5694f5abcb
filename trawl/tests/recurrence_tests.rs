//! Recurrence scheduler and cleanup service tests.

mod common;

use chrono::{Days, NaiveDate, Utc};

use common::{Behave, Harness, ScriptedBackend};
use trawl::database::models::{JobStatus, Platform};
use trawl::database::repositories::{CredentialRepository, JobRepository};
use trawl::database::time;
use trawl::submission::SubmissionRequest;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn submit_recurring(
    harness: &Harness,
    created_today: NaiveDate,
    recur_until: NaiveDate,
) -> String {
    let mut request = SubmissionRequest::for_platform(Platform::Bluesky);
    request.keywords = Some("madrid".to_string());
    request.recurring = true;
    request.recur_until = Some(recur_until);
    harness
        .container
        .submission
        .submit_with_today(&request, created_today)
        .await
        .unwrap()
        .job_id
}

#[tokio::test]
async fn test_recurring_submission_creates_scheduled_parent_without_tasks() {
    let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
    let parent_id = submit_recurring(&harness, day(2025, 7, 20), day(2025, 8, 1)).await;

    let parent = harness.container.jobs.get_job(&parent_id).await.unwrap();
    assert!(parent.is_parent);
    assert!(parent.is_recurring);
    assert_eq!(parent.get_status(), Some(JobStatus::Scheduled));
    assert_eq!(parent.get_recur_until(), Some(day(2025, 8, 1)));

    // Nothing is enqueued until the first tick.
    assert_eq!(harness.container.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_tick_materializes_yesterdays_child_once() {
    let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
    let parent_id = submit_recurring(&harness, day(2025, 7, 20), day(2025, 8, 1)).await;

    // First tick on 07-21 creates exactly one child covering 07-20.
    harness
        .container
        .scheduler
        .tick(day(2025, 7, 21))
        .await
        .unwrap();

    let children = harness.container.jobs.get_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 1);
    let params = children[0].get_search_params().unwrap();
    assert_eq!(params.date_from, Some(day(2025, 7, 20)));
    assert_eq!(params.date_to, Some(day(2025, 7, 21)));
    assert_eq!(children[0].get_status(), Some(JobStatus::Waiting));
    assert_eq!(harness.container.queue.depth().await.unwrap(), 1);

    // A second tick the same day is a no-op.
    harness
        .container
        .scheduler
        .tick(day(2025, 7, 21))
        .await
        .unwrap();
    let children = harness.container.jobs.get_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 1, "tick must be idempotent per day");

    // The next day's tick adds the following window.
    harness
        .container
        .scheduler
        .tick(day(2025, 7, 22))
        .await
        .unwrap();
    let children = harness.container.jobs.get_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 2);
}

#[tokio::test]
async fn test_tick_retires_parent_past_end_date() {
    let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
    let parent_id = submit_recurring(&harness, day(2025, 7, 20), day(2025, 8, 1)).await;

    harness
        .container
        .scheduler
        .tick(day(2025, 8, 2))
        .await
        .unwrap();

    let parent = harness.container.jobs.get_job(&parent_id).await.unwrap();
    assert_eq!(parent.get_status(), Some(JobStatus::Completed));
    assert!(parent.completed_at.is_some());
    // No child was created for the retired parent.
    assert!(harness
        .container
        .jobs
        .get_children(&parent_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_recurring_parent_stays_scheduled_after_successful_children() {
    let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(2))).await;
    harness
        .seed_credential(Platform::Bluesky, "alice.bsky.social")
        .await;

    // End date far in the future relative to the real clock, since the
    // worker aggregates with the current date.
    let today = Utc::now().date_naive();
    let recur_until = today + Days::new(30);
    let parent_id = submit_recurring(&harness, today, recur_until).await;

    harness.container.scheduler.tick(today).await.unwrap();
    harness.drain_queue().await;

    let children = harness.container.jobs.get_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].get_status(), Some(JobStatus::Completed));

    // All children completed, but the end date has not passed: the parent
    // keeps waiting for its next child, never `completed`.
    let parent = harness.container.jobs.get_job(&parent_id).await.unwrap();
    assert_eq!(parent.get_status(), Some(JobStatus::Scheduled));
    assert!(parent.completed_at.is_none());
}

#[tokio::test]
async fn test_recurring_parent_with_failed_child_is_partial_failure() {
    let backend = ScriptedBackend::new(Behave::FailPartial(0, "blocked"));
    let harness = Harness::with_config_tweak(backend, |config| {
        config.queue_max_attempts = 1;
    })
    .await;
    harness
        .seed_credential(Platform::Bluesky, "alice.bsky.social")
        .await;

    let today = Utc::now().date_naive();
    let parent_id = submit_recurring(&harness, today, today + Days::new(30)).await;

    harness.container.scheduler.tick(today).await.unwrap();
    harness.drain_queue().await;

    let parent = harness.container.jobs.get_job(&parent_id).await.unwrap();
    assert_eq!(parent.get_status(), Some(JobStatus::PartialFailure));
    // Non-terminal for a recurring parent: the next tick still runs it.
    assert!(parent.completed_at.is_none());

    // And the next day's tick picks it up again despite the failure.
    let tomorrow = today + Days::new(1);
    harness.container.scheduler.tick(tomorrow).await.unwrap();
    let children = harness.container.jobs.get_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 2);
}

#[tokio::test]
async fn test_tick_resets_daily_use_counters() {
    let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
    let credential = harness
        .seed_credential(Platform::Bluesky, "alice.bsky.social")
        .await;
    sqlx::query("UPDATE credential SET daily_use_count = 7 WHERE id = ?")
        .bind(&credential.id)
        .execute(&harness.container.pool)
        .await
        .unwrap();

    harness
        .container
        .scheduler
        .tick(day(2025, 7, 21))
        .await
        .unwrap();

    let stored = harness.container.credentials.get(&credential.id).await.unwrap();
    assert_eq!(stored.daily_use_count, 0);
}

mod cleanup_tests {
    use super::*;

    /// Complete one singleton job and age its result file by `days_ago`.
    async fn completed_job_with_file(harness: &Harness, days_ago: i64) -> String {
        harness
            .seed_credential(Platform::Bluesky, "alice.bsky.social")
            .await;
        let mut request = SubmissionRequest::for_platform(Platform::Bluesky);
        request.keywords = Some("madrid".to_string());
        let outcome = harness.container.submission.submit(&request).await.unwrap();
        harness.drain_queue().await;

        let expires_at = (Utc::now() - chrono::Duration::days(days_ago)).to_rfc3339();
        sqlx::query("UPDATE job SET expires_at = ? WHERE id = ?")
            .bind(&expires_at)
            .bind(&outcome.job_id)
            .execute(&harness.container.pool)
            .await
            .unwrap();
        outcome.job_id
    }

    #[tokio::test]
    async fn test_cleanup_deletes_expired_files() {
        let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
        let job_id = completed_job_with_file(&harness, 1).await;

        let job = harness.container.jobs.get_job(&job_id).await.unwrap();
        let file_name = job.file_path.clone().unwrap();
        let full_path = harness
            .ctx
            .results
            .base_dir()
            .join("bluesky")
            .join(&file_name);
        assert!(full_path.exists());

        let deleted = harness.container.cleanup.run_cleanup().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!full_path.exists());

        let job = harness.container.jobs.get_job(&job_id).await.unwrap();
        assert!(job.file_deleted);
        // The path itself is never cleared, only flagged.
        assert_eq!(job.file_path.as_deref(), Some(file_name.as_str()));

        // A second sweep finds nothing.
        assert_eq!(harness.container.cleanup.run_cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_skips_unexpired_files() {
        let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
        let job_id = completed_job_with_file(&harness, -10).await;

        let deleted = harness.container.cleanup.run_cleanup().await.unwrap();
        assert_eq!(deleted, 0);
        let job = harness.container.jobs.get_job(&job_id).await.unwrap();
        assert!(!job.file_deleted);
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_already_missing_file() {
        let harness = Harness::new(ScriptedBackend::new(Behave::Succeed(1))).await;
        let job_id = completed_job_with_file(&harness, 1).await;

        let job = harness.container.jobs.get_job(&job_id).await.unwrap();
        let full_path = harness
            .ctx
            .results
            .base_dir()
            .join("bluesky")
            .join(job.file_path.as_deref().unwrap());
        tokio::fs::remove_file(&full_path).await.unwrap();

        let deleted = harness.container.cleanup.run_cleanup().await.unwrap();
        assert_eq!(deleted, 1);
        let job = harness.container.jobs.get_job(&job_id).await.unwrap();
        assert!(job.file_deleted);
    }

    #[tokio::test]
    async fn test_expires_at_is_stamped_from_retention_window() {
        let harness = Harness::with_config_tweak(
            ScriptedBackend::new(Behave::Succeed(1)),
            |config| config.result_retention_days = 7,
        )
        .await;
        harness
            .seed_credential(Platform::Bluesky, "alice.bsky.social")
            .await;
        let mut request = SubmissionRequest::for_platform(Platform::Bluesky);
        request.keywords = Some("madrid".to_string());
        let outcome = harness.container.submission.submit(&request).await.unwrap();
        harness.drain_queue().await;

        let job = harness.container.jobs.get_job(&outcome.job_id).await.unwrap();
        let expires = time::parse_rfc3339(job.expires_at.as_deref().unwrap()).unwrap();
        let expected = Utc::now() + chrono::Duration::days(7);
        let drift = (expires - expected).num_seconds().abs();
        assert!(drift < 60, "expires_at should be ~7 days out");
    }
}
