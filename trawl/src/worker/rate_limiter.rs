//! Rate limiting for scrape task starts.
//!
//! Implements a sliding-window limiter shared across all workers: at most
//! `max_starts` tasks may begin inside any rolling window, respecting the
//! request ceilings the platforms impose on automation accounts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum task starts per rolling window.
    pub max_starts: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_starts: 2,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window rate limiter over task start times.
pub struct WindowRateLimiter {
    config: RateLimiterConfig,
    starts: Mutex<VecDeque<Instant>>,
}

impl WindowRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to record a task start now.
    ///
    /// Returns `true` if the start fits in the current window.
    pub async fn try_acquire(&self) -> bool {
        let mut starts = self.starts.lock().await;
        let now = Instant::now();
        Self::prune(&mut starts, now, self.config.window);

        if (starts.len() as u32) < self.config.max_starts {
            starts.push_back(now);
            true
        } else {
            false
        }
    }

    /// Record a task start, waiting until the window has room.
    ///
    /// Returns the duration waited.
    ///
    /// # Cancel Safety
    ///
    /// The mutex is never held across an await point: availability is
    /// checked under the lock, the wait happens outside it, and the loop
    /// retries. Dropping the future mid-wait consumes nothing.
    pub async fn acquire(&self) -> Duration {
        let mut total_wait = Duration::ZERO;

        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                Self::prune(&mut starts, now, self.config.window);

                if (starts.len() as u32) < self.config.max_starts {
                    starts.push_back(now);
                    return total_wait;
                }

                // Oldest start leaving the window frees the next slot.
                match starts.front() {
                    Some(oldest) => (*oldest + self.config.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            trace!(wait = ?wait, "rate limited");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
            total_wait += wait;
        }
    }

    /// Number of starts still available in the current window.
    pub async fn available(&self) -> u32 {
        let mut starts = self.starts.lock().await;
        Self::prune(&mut starts, Instant::now(), self.config.window);
        self.config.max_starts.saturating_sub(starts.len() as u32)
    }

    fn prune(starts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = starts.front() {
            if now.duration_since(*oldest) >= window {
                starts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for WindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
