//! Tiered rate-limit decisions: route, then per-IP, then global.
//!
//! The first tier to report `limited` short-circuits; otherwise the last
//! evaluated tier's headers describe the admission. Whitelisted client
//! IPs bypass all counting when per-IP limiting is enabled.

use super::{
    Key, RateLimitError, RateLimitResult, Store, HEADER_RATE_LIMIT, HEADER_RATE_REMAINING,
    HEADER_RATE_RESET, HEADER_RETRY_AFTER,
};
use crate::config::{RateLimitSettings, RouteLimit};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum WhitelistEntry {
    Addr(IpAddr),
    Net(IpNet),
}

impl WhitelistEntry {
    fn contains(&self, ip: IpAddr) -> bool {
        match self {
            WhitelistEntry::Addr(addr) => *addr == ip,
            WhitelistEntry::Net(net) => net.contains(&ip),
        }
    }
}

/// Multi-tier limiter over a shared counter [`Store`].
pub struct RateLimiter {
    settings: RateLimitSettings,
    store: Arc<dyn Store>,
    whitelist: Vec<WhitelistEntry>,
}

impl RateLimiter {
    /// Builds the limiter, parsing whitelist entries once. Malformed
    /// entries are a configuration error.
    pub fn new(
        settings: RateLimitSettings,
        store: Arc<dyn Store>,
    ) -> Result<Self, RateLimitError> {
        let whitelist = settings
            .per_ip
            .whitelist
            .iter()
            .map(|entry| {
                if entry.contains('/') {
                    entry
                        .parse::<IpNet>()
                        .map(WhitelistEntry::Net)
                        .map_err(|e| {
                            RateLimitError::Config(format!("bad whitelist CIDR {entry}: {e}"))
                        })
                } else {
                    entry
                        .parse::<IpAddr>()
                        .map(WhitelistEntry::Addr)
                        .map_err(|e| {
                            RateLimitError::Config(format!("bad whitelist IP {entry}: {e}"))
                        })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            settings,
            store,
            whitelist,
        })
    }

    /// Decides admission for one request.
    pub async fn allow(
        &self,
        method: &str,
        path: &str,
        ip: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        if !self.settings.enabled {
            return Ok(RateLimitResult::admitted());
        }

        if self.settings.per_ip.enabled && self.is_whitelisted(ip) {
            return Ok(RateLimitResult::admitted());
        }

        let key = Key {
            method: method.to_string(),
            path: path.to_string(),
            ip: ip.to_string(),
            ..Key::default()
        };

        let mut result = RateLimitResult::admitted();

        if let Some(route) = self.find_route_limit(method, path) {
            let route_key = match route.group.as_str() {
                "" => key.with_suffix("route"),
                group => Key {
                    group: group.to_string(),
                    ..key.clone()
                }
                .with_suffix("route"),
            };
            result = self
                .check_tier(&route_key, route.requests, route.window, route.burst)
                .await?;
            if result.limited {
                return Ok(result);
            }
        }

        if self.settings.per_ip.enabled {
            let per_ip = &self.settings.per_ip;
            result = self
                .check_tier(
                    &key.with_suffix("ip"),
                    per_ip.requests,
                    per_ip.window,
                    per_ip.burst,
                )
                .await?;
            if result.limited {
                return Ok(result);
            }
        }

        if self.settings.global.enabled {
            let global = &self.settings.global;
            result = self
                .check_tier(
                    &key.with_suffix("global"),
                    global.requests,
                    global.window,
                    global.burst,
                )
                .await?;
            if result.limited {
                return Ok(result);
            }
        }

        Ok(result)
    }

    /// Clears the counters for a key across all tiers.
    pub async fn reset(&self, key: &Key) -> Result<(), RateLimitError> {
        for tier in ["route", "ip", "global"] {
            self.store.reset(&key.with_suffix(tier)).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.whitelist.iter().any(|entry| entry.contains(addr))
    }

    /// Picks the best matching route limit: highest priority, ties broken
    /// by the longer (more specific) pattern.
    fn find_route_limit(&self, method: &str, path: &str) -> Option<&RouteLimit> {
        let mut best: Option<&RouteLimit> = None;

        for route in &self.settings.routes {
            if route.method != "*" && route.method != method {
                continue;
            }
            if !path_match(&route.path, path) {
                continue;
            }

            best = match best {
                None => Some(route),
                Some(current) if route.priority > current.priority => Some(route),
                Some(current)
                    if route.priority == current.priority
                        && route.path.len() > current.path.len() =>
                {
                    Some(route)
                }
                Some(current) => Some(current),
            };
        }

        best
    }

    /// Fixed-window check for one tier. The read and the increment are
    /// separate store calls; under contention up to `burst` extra
    /// admissions may slip through, which is accepted slack.
    async fn check_tier(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        burst: u64,
    ) -> Result<RateLimitResult, RateLimitError> {
        let (mut count, mut reset_at) = self.store.get(key).await?;

        let now = Utc::now();
        if now >= reset_at {
            reset_at = now
                + ChronoDuration::from_std(window)
                    .unwrap_or_else(|_| ChronoDuration::seconds(60));
            count = 0;
        }

        if count >= limit + burst {
            let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            return Ok(RateLimitResult {
                limited: true,
                remaining: 0,
                reset_at,
                retry_after,
                headers: limit_headers(limit, 0, reset_at, Some(retry_after)),
            });
        }

        let new_count = self.store.increment(key, reset_at).await?;
        let remaining = (limit + burst).saturating_sub(new_count);

        Ok(RateLimitResult {
            limited: false,
            remaining,
            reset_at,
            retry_after: Duration::ZERO,
            headers: limit_headers(limit, remaining, reset_at, None),
        })
    }
}

fn limit_headers(
    limit: u64,
    remaining: u64,
    reset_at: DateTime<Utc>,
    retry_after: Option<Duration>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_numeric(&mut headers, HEADER_RATE_LIMIT, limit);
    insert_numeric(&mut headers, HEADER_RATE_REMAINING, remaining);
    insert_numeric(&mut headers, HEADER_RATE_RESET, reset_at.timestamp().max(0) as u64);
    if let Some(retry_after) = retry_after {
        insert_numeric(&mut headers, HEADER_RETRY_AFTER, retry_after.as_secs());
    }
    headers
}

fn insert_numeric(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Segment-wise path match; `*` wildcards exactly one segment. A pattern
/// without wildcards requires exact equality.
fn path_match(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();
    if pattern_parts.len() != path_parts.len() {
        return false;
    }

    pattern_parts
        .iter()
        .zip(&path_parts)
        .all(|(pattern_part, path_part)| *pattern_part == "*" || pattern_part == path_part)
}
