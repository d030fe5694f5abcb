//! Cancellation channel.
//!
//! A TTL-based flag store keyed by job id, enabling cooperative abort
//! across the process boundary into the scrape backend: a cancel request
//! sets the flag, the worker polls it at every checkpoint. Cancellation is
//! advisory; a backend that never reaches a checkpoint cannot be stopped.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::Result;

/// Default TTL for cancellation flags (one hour).
pub const DEFAULT_CANCEL_TTL: Duration = Duration::from_secs(3600);

/// Contract of the shared cancellation flag store.
///
/// The backing store is created once at startup and injected into the
/// components that need it; it is not reached through a global.
#[async_trait]
pub trait CancellationChannel: Send + Sync {
    /// Raise the cancellation flag for a job, expiring after `ttl`.
    async fn set(&self, job_id: &str, ttl: Duration) -> Result<()>;

    /// Check whether a live (non-expired) flag exists for a job.
    async fn is_set(&self, job_id: &str) -> Result<bool>;

    /// Drop the flag, live or expired.
    async fn clear(&self, job_id: &str) -> Result<()>;
}

/// In-process implementation backed by a concurrent map of deadlines.
///
/// Expired entries are dropped lazily on read and opportunistically on
/// write, which keeps the map bounded by the number of recently cancelled
/// jobs.
pub struct InMemoryCancellationChannel {
    deadlines: DashMap<String, Instant>,
}

impl InMemoryCancellationChannel {
    pub fn new() -> Self {
        Self {
            deadlines: DashMap::new(),
        }
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.deadlines.retain(|_, deadline| *deadline > now);
    }
}

impl Default for InMemoryCancellationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancellationChannel for InMemoryCancellationChannel {
    async fn set(&self, job_id: &str, ttl: Duration) -> Result<()> {
        self.purge_expired();
        self.deadlines
            .insert(job_id.to_string(), Instant::now() + ttl);
        debug!(job_id, ttl_secs = ttl.as_secs(), "Cancellation flag set");
        Ok(())
    }

    async fn is_set(&self, job_id: &str) -> Result<bool> {
        // Copy the deadline out so the shard guard is released before any
        // mutation below.
        let deadline = self.deadlines.get(job_id).map(|entry| *entry);
        match deadline {
            Some(deadline) if deadline > Instant::now() => Ok(true),
            Some(_) => {
                self.deadlines.remove(job_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self, job_id: &str) -> Result<()> {
        self.deadlines.remove(job_id);
        Ok(())
    }
}
