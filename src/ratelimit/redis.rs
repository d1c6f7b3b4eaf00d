//! Redis-backed counter store for distributed rate limiting.
//!
//! Fixed-window counters are pipelined `INCR` + `PEXPIRE` so every write
//! refreshes the key TTL and abandoned keys expire on their own. Two
//! alternative modes are provided: a sliding window over a sorted set of
//! event timestamps, and a token bucket refilled atomically by a
//! server-side script.

use super::{RateLimitError, Store};
use crate::config::RedisSettings;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local fill_rate = tonumber(ARGV[2])
local fill_interval = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_fill')
local tokens = tonumber(bucket[1] or capacity)
local last_fill = tonumber(bucket[2] or now)

local elapsed = now - last_fill
local refill = math.floor(elapsed / fill_interval * fill_rate)
tokens = math.min(capacity, tokens + refill)

if tokens > 0 then
    tokens = tokens - 1
    redis.call('HMSET', key, 'tokens', tokens, 'last_fill', now)
    redis.call('EXPIRE', key, fill_interval * 2)
    return 1
end

return 0
"#;

/// Distributed [`Store`] over a managed Redis connection.
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
    token_bucket: Script,
}

impl RedisStore {
    /// Connects and verifies the server with a `PING`.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, RateLimitError> {
        info!(
            host = %settings.host,
            port = settings.port,
            db = settings.db,
            "connecting to redis rate limit store"
        );

        let client = redis::Client::open(settings.url())?;
        let conn = tokio::time::timeout(settings.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RateLimitError::Store("redis connection timed out".to_string()))??;

        let store = Self {
            conn,
            timeout: settings.timeout,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        };

        let mut conn = store.conn.clone();
        store
            .bounded(async move {
                redis::cmd("PING").query_async::<()>(&mut conn).await?;
                Ok(())
            })
            .await?;

        info!("connected to redis rate limit store");
        Ok(store)
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, RateLimitError>>,
    ) -> Result<T, RateLimitError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| RateLimitError::Store("redis operation timed out".to_string()))?
    }

    /// Sliding-window count: records the event, trims entries older than
    /// `now − window`, and returns the number of events remaining inside
    /// the window.
    pub async fn sliding_window_increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<u64, RateLimitError> {
        let now_ms = Utc::now().timestamp_millis();
        let floor_ms = now_ms - window.as_millis() as i64;
        let mut conn = self.conn.clone();
        let key = key.to_string();

        self.bounded(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&key)
                .arg(now_ms)
                .arg(now_ms)
                .ignore()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg(0)
                .arg(floor_ms)
                .ignore()
                .cmd("ZCARD")
                .arg(&key)
                .cmd("PEXPIRE")
                .arg(&key)
                .arg(window.as_millis() as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    /// Takes one token from the bucket, refilling server-side first.
    /// Returns whether a token was available.
    pub async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u64,
        fill_rate: f64,
        fill_interval: Duration,
    ) -> Result<bool, RateLimitError> {
        let mut conn = self.conn.clone();
        let invocation_key = key.to_string();
        let script = self.token_bucket.clone();

        self.bounded(async move {
            let taken: i64 = script
                .key(invocation_key)
                .arg(capacity)
                .arg(fill_rate)
                .arg(fill_interval.as_secs().max(1))
                .arg(Utc::now().timestamp())
                .invoke_async(&mut conn)
                .await?;
            Ok(taken == 1)
        })
        .await
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<(u64, DateTime<Utc>), RateLimitError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();

        let (count, ttl_ms) = self
            .bounded(async move {
                let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
                    .get(&key)
                    .pttl(&key)
                    .query_async(&mut conn)
                    .await?;
                Ok((count, ttl_ms))
            })
            .await?;

        let now = Utc::now();
        // PTTL is negative for a missing key or one without an expiry;
        // either way the window reads as empty.
        if ttl_ms <= 0 {
            return Ok((0, now));
        }

        let reset_at = now + ChronoDuration::milliseconds(ttl_ms);
        debug!(count = count.unwrap_or(0), ttl_ms, "fetched rate limit window");
        Ok((count.unwrap_or(0), reset_at))
    }

    async fn increment(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, RateLimitError> {
        let ttl_ms = (reset_at - Utc::now()).num_milliseconds().max(1);
        let mut conn = self.conn.clone();
        let key = key.to_string();

        self.bounded(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(&key, 1u64)
                .pexpire(&key, ttl_ms)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();

        self.bounded(async move {
            redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        // The managed connection closes when the last clone drops.
        debug!("closing redis rate limit store");
    }
}
