//! In-process rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{RateLimitDecision, RateLimitError, RateLimiter};

#[derive(Debug, Clone, Copy)]
struct Window {
    count: i64,
    expires_at: Instant,
}

impl Window {
    fn decision(&self, limit: i64, now: Instant) -> RateLimitDecision {
        RateLimitDecision {
            count: self.count,
            reset_after: self.expires_at.saturating_duration_since(now),
            allowed: self.count <= limit,
        }
    }
}

/// Rate limiter holding its windows in a `DashMap`.
///
/// The per-key entry lock makes the expiry check and the increment one atomic
/// step. Counters live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRateLimiter {
    windows: DashMap<String, Window>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that have closed.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows.retain(|_, w| w.expires_at > now);
    }

    /// Spawn a periodic cleanup task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.cleanup();
            }
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            *entry = Window {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;
        Ok(entry.decision(limit, now))
    }

    async fn peek(
        &self,
        key: &str,
        limit: i64,
    ) -> Result<Option<RateLimitDecision>, RateLimitError> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|w| w.expires_at > now)
            .map(|w| w.decision(limit, now)))
    }
}
