//! In-process counter store: a window map under a read-write lock with a
//! background sweeper that evicts expired windows.

use super::{RateLimitError, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Memory-backed [`Store`]. Reads take the read lock; increments, resets,
/// and the sweeper take the write lock.
pub struct MemoryStore {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Creates the store and spawns the expired-window sweeper on the
    /// given cadence.
    pub fn new(sweep_interval: Duration) -> Self {
        let windows = Arc::new(RwLock::new(HashMap::new()));
        let sweeper = tokio::spawn(Self::sweep(Arc::clone(&windows), sweep_interval));

        Self {
            windows,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    async fn sweep(windows: Arc<RwLock<HashMap<String, Window>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let mut map = windows.write();
            let before = map.len();
            map.retain(|_, window| window.reset_at > now);
            let swept = before - map.len();
            if swept > 0 {
                debug!(swept, remaining = map.len(), "swept expired rate limit windows");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.windows.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<(u64, DateTime<Utc>), RateLimitError> {
        let now = Utc::now();
        let map = self.windows.read();
        match map.get(key) {
            Some(window) if window.reset_at > now => Ok((window.count, window.reset_at)),
            _ => Ok((0, now)),
        }
    }

    async fn increment(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, RateLimitError> {
        let now = Utc::now();
        let mut map = self.windows.write();
        let window = map
            .entry(key.to_string())
            .and_modify(|window| {
                if now > window.reset_at {
                    window.count = 1;
                    window.reset_at = reset_at;
                } else {
                    window.count += 1;
                }
            })
            .or_insert(Window { count: 1, reset_at });
        Ok(window.count)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.windows.write().remove(key);
        Ok(())
    }

    async fn close(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.windows.write().clear();
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}
