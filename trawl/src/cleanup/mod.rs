//! Cleanup service.
//!
//! Deletes result files whose retention window has expired and records the
//! deletion on the job. Jobs themselves are never hard-deleted.

use std::sync::Arc;

use tracing::{info, warn};

use crate::database::repositories::JobRepository;
use crate::database::time;
use crate::scrape::ResultStore;
use crate::Result;

/// The cleanup service.
pub struct CleanupService {
    jobs: Arc<dyn JobRepository>,
    results: Arc<ResultStore>,
}

impl CleanupService {
    pub fn new(jobs: Arc<dyn JobRepository>, results: Arc<ResultStore>) -> Self {
        Self { jobs, results }
    }

    /// Delete expired result files.
    ///
    /// A missing file counts as deleted; other IO errors are logged and
    /// the job is left for the next tick. One job's error never aborts the
    /// sweep. Returns the number of files marked deleted.
    pub async fn run_cleanup(&self) -> Result<u64> {
        let now = time::now_rfc3339();
        let expired = self.jobs.list_expired_file_jobs(&now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        info!("Found {} expired result files to clean up", expired.len());
        let mut deleted = 0u64;

        for job in &expired {
            let Some(file_path) = &job.file_path else {
                continue;
            };
            match self.results.delete(&job.platform, file_path).await {
                Ok(()) => {
                    if let Err(e) = self.jobs.mark_file_deleted(&job.id).await {
                        warn!(job_id = %job.id, "Failed to mark file deleted: {}", e);
                        continue;
                    }
                    deleted += 1;
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        file = %file_path,
                        "Failed to delete result file, leaving for next tick: {}",
                        e
                    );
                }
            }
        }

        info!("Cleanup removed {} result files", deleted);
        Ok(deleted)
    }
}
