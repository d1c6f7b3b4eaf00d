//! Multi-tier rate limiting on a pluggable counter store.
//!
//! A [`Store`] is an atomic counter-with-expiry keyed by string; the
//! [`RateLimiter`] evaluates the route, per-IP, and global tiers against
//! it in that order. Tier keys share a request-derived [`Key`] prefix and
//! are partitioned by a tier suffix so counters never collide.

pub mod limiter;
pub mod memory;
pub mod middleware;
pub mod redis;

pub use limiter::RateLimiter;
pub use memory::MemoryStore;
pub use middleware::{rate_limit_middleware, RateLimitState};
pub use redis::RedisStore;

use crate::config::RateLimitSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Rate-limit response headers.
pub const HEADER_RATE_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RATE_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    Store(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("invalid rate limit configuration: {0}")]
    Config(String),
}

/// Composite rate-limit key. Serializes to a deterministic colon-joined
/// string; empty optional parts are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Key {
    pub method: String,
    pub path: String,
    pub ip: String,
    pub group: String,
    pub client_id: String,
    pub user_id: String,
}

impl Key {
    /// Appends a tier partition suffix (`route`, `ip`, `global`).
    pub fn with_suffix(&self, suffix: &str) -> String {
        format!("{self}:{suffix}")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.path)?;
        for part in [&self.ip, &self.group, &self.client_id, &self.user_id] {
            if !part.is_empty() {
                write!(f, ":{part}")?;
            }
        }
        Ok(())
    }
}

/// Outcome of a rate-limit decision, including the headers to attach to
/// the client response.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub limited: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
    pub headers: HeaderMap,
}

impl RateLimitResult {
    /// An unconditional admission carrying no headers (disabled limiter,
    /// whitelisted client).
    pub fn admitted() -> Self {
        Self {
            limited: false,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after: Duration::ZERO,
            headers: HeaderMap::new(),
        }
    }
}

/// Atomic counter-with-expiry storage for window counters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the current count and window reset time for a key.
    /// A missing or expired window reads as `(0, now)`.
    async fn get(&self, key: &str) -> Result<(u64, DateTime<Utc>), RateLimitError>;

    /// Atomically increments the counter for a key and returns the new
    /// count. A missing or expired window is seeded with count 1 and the
    /// supplied reset time.
    async fn increment(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, RateLimitError>;

    /// Deletes the counter for a key.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Releases store resources (connections, background sweeper).
    async fn close(&self);
}

/// Builds the store selected by `rate_limit.storage.type`.
pub async fn build_store(
    settings: &RateLimitSettings,
) -> Result<Arc<dyn Store>, RateLimitError> {
    match settings.storage.storage_type.as_str() {
        "redis" => {
            let store = RedisStore::connect(&settings.storage.redis).await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryStore::new(settings.storage.sweep_interval))),
        other => Err(RateLimitError::Config(format!(
            "unsupported rate limit storage type: {other}"
        ))),
    }
}
