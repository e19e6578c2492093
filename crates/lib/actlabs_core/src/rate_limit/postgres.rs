//! PostgreSQL-backed rate limiter, shared by every instance pointing at the
//! same database.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{RateLimitDecision, RateLimitError, RateLimiter};

/// Rate limiter storing windows in `rate_limit_counters`.
///
/// The increment, the expiry check and the window reset happen in one
/// `INSERT … ON CONFLICT` statement, so concurrent hits on the same key are
/// serialized by the row lock.
#[derive(Clone)]
pub struct PgRateLimiter {
    pool: PgPool,
}

impl PgRateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete closed windows, returning how many were removed.
    pub async fn cleanup(&self) -> Result<u64, RateLimitError> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn decision(count: i64, remaining_secs: f64, limit: i64) -> RateLimitDecision {
    RateLimitDecision {
        count,
        reset_after: Duration::from_secs_f64(remaining_secs.max(0.0)),
        allowed: count <= limit,
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn allow(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let (count, remaining) = sqlx::query_as::<_, (i64, f64)>(
            r#"
            INSERT INTO rate_limit_counters AS c (key, count, expires_at)
            VALUES ($1, 1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET
                count = CASE WHEN c.expires_at <= now() THEN 1 ELSE c.count + 1 END,
                expires_at = CASE WHEN c.expires_at <= now() THEN EXCLUDED.expires_at ELSE c.expires_at END
            RETURNING c.count, EXTRACT(EPOCH FROM (c.expires_at - now()))::float8
            "#,
        )
        .bind(key)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(decision(count, remaining, limit))
    }

    async fn peek(
        &self,
        key: &str,
        limit: i64,
    ) -> Result<Option<RateLimitDecision>, RateLimitError> {
        let row = sqlx::query_as::<_, (i64, f64)>(
            "SELECT count, EXTRACT(EPOCH FROM (expires_at - now()))::float8 \
             FROM rate_limit_counters WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count, remaining)| decision(count, remaining, limit)))
    }
}
