//! Fixed-window counters for throttling abusive clients.
//!
//! Each key owns at most one live window. The first hit opens a window of the
//! requested length; every hit inside it increments the count; once the
//! window has elapsed the next hit starts over at 1.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryRateLimiter;
pub use postgres::PgRateLimiter;

/// Bad requests tolerated per client within [`BAD_REQUEST_WINDOW`].
pub const BAD_REQUEST_LIMIT: i64 = 10;

/// Window over which bad requests are counted: 10 minutes.
pub const BAD_REQUEST_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Outcome of a counter update or lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Hits recorded in the live window.
    pub count: i64,
    /// Time until the live window closes.
    pub reset_after: Duration,
    /// False once `count` exceeds the limit.
    pub allowed: bool,
}

/// Rate limiter backend errors.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
}

/// Shared counter store keyed by client identity.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one hit for `key` and report whether it is still within `limit`.
    async fn allow(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError>;

    /// Report the live window for `key` without recording a hit.
    async fn peek(&self, key: &str, limit: i64)
    -> Result<Option<RateLimitDecision>, RateLimitError>;
}
