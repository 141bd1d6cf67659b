//! Per-sender SMS throughput windows.
//!
//! A fixed window of `rate_limit_interval_secs` seconds starts with the first
//! send. Redis `SET NX EX` opens the window and `INCR` counts sends inside it,
//! both in one transaction; the TTL closes it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use relay_common::types::SenderRateLimit;

use crate::error::Result;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one send against the sender's window.
    ///
    /// Returns `false` when the window is already full and the send must wait.
    async fn try_acquire(&self, limit: &SenderRateLimit) -> Result<bool>;
}

/// Redis-backed sender rate limiter.
#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: ConnectionManager,
}

impl RedisRateLimiter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(limit: &SenderRateLimit) -> String {
        format!("sender:rate_limit:{}", limit.sender_id)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(&self, limit: &SenderRateLimit) -> Result<bool> {
        if !limit.is_enabled() {
            return Ok(true);
        }

        let key = Self::key(limit);
        let mut conn = self.redis.clone();

        // MULTI/EXEC: the window cannot expire between opening and counting,
        // so the counter always carries a TTL.
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(limit.rate_limit_interval_secs)
            .ignore()
            .cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        let allowed = count <= i64::from(limit.rate_limit);

        if !allowed {
            tracing::debug!(
                sender_id = %limit.sender_id,
                count,
                rate_limit = limit.rate_limit,
                "Sender over rate limit"
            );
        }

        Ok(allowed)
    }
}
