//! Layered configuration: defaults, a YAML file, then `MUHTAR__`-prefixed
//! environment overrides.
//!
//! Duration-valued keys accept humantime strings (`"60s"`, `"100ms"`).

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Re-export ConfigError so it can be used in error.rs
pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub proxy: ProxySettings,
    pub log: LogSettings,
    pub db: DbSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxySettings {
    /// Upstream base URL every request is forwarded to.
    pub target: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_idle_conns: usize,
    #[serde(with = "humantime_serde")]
    pub idle_conn_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tls_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub expect_continue_timeout: Duration,
    pub max_conns_per_host: usize,
    /// Retries for connection-level upstream failures only.
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_wait_time: Duration,
    pub transform: TransformSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            target: "http://localhost:9000".to_string(),
            timeout: Duration::from_secs(30),
            max_idle_conns: 100,
            idle_conn_timeout: Duration::from_secs(90),
            tls_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            max_conns_per_host: 100,
            retry_count: 0,
            retry_wait_time: Duration::from_millis(100),
            transform: TransformSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TransformSettings {
    /// Directory holding `<service_name>/request.rhai` and `response.rhai`.
    pub scripts_dir: PathBuf,
    pub services: HashMap<String, ServiceTransform>,
}

/// Transformation binding for one service: requests whose path equals
/// `url` run the scripts under `<scripts_dir>/<service_name>/`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceTransform {
    pub url: String,
    pub service_name: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbSettings {
    /// Repository backend tag: `postgres` or `memory`.
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool: PoolSettings,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            db_type: "memory".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "password".to_string(),
            database: "muhtar".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

impl DbSettings {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub max_conns: u32,
    pub min_conns: u32,
    /// Telemetry sink flush threshold.
    pub batch_size: usize,
    /// Telemetry sink workers per direction.
    pub workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_conns: 10,
            min_conns: 2,
            batch_size: 100,
            workers: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Admit requests when the rate-limit store is unreachable.
    pub fail_open: bool,
    pub global: TierSettings,
    pub per_ip: PerIpSettings,
    pub routes: Vec<RouteLimit>,
    pub token_bucket: TokenBucketSettings,
    pub sliding_window: SlidingWindowSettings,
    pub response: ResponseSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TierSettings {
    pub enabled: bool,
    pub requests: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub burst: u64,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests: 1000,
            window: Duration::from_secs(60),
            burst: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PerIpSettings {
    pub enabled: bool,
    pub requests: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub burst: u64,
    /// Exact IPs or CIDR blocks exempt from per-IP counting.
    pub whitelist: Vec<String>,
}

impl Default for PerIpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests: 100,
            window: Duration::from_secs(60),
            burst: 0,
            whitelist: Vec::new(),
        }
    }
}

/// A per-route limit. `path` supports `*` wildcarding one segment;
/// `method: "*"` matches any method. Among matching routes the highest
/// `priority` wins, ties broken by the longer (more specific) pattern.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RouteLimit {
    pub path: String,
    pub method: String,
    pub requests: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub burst: u64,
    pub group: String,
    pub priority: i32,
}

impl Default for RouteLimit {
    fn default() -> Self {
        Self {
            path: String::new(),
            method: "*".to_string(),
            requests: 100,
            window: Duration::from_secs(60),
            burst: 0,
            group: String::new(),
            priority: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TokenBucketSettings {
    pub enabled: bool,
    pub capacity: u64,
    pub fill_rate: f64,
    #[serde(with = "humantime_serde")]
    pub fill_interval: Duration,
}

impl Default for TokenBucketSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 100,
            fill_rate: 10.0,
            fill_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SlidingWindowSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub size: Duration,
    pub segments: u32,
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            size: Duration::from_secs(60),
            segments: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResponseSettings {
    pub status_code: u16,
    pub message: String,
    /// Attach `X-RateLimit-*` headers to admitted and limited responses.
    pub headers: bool,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            status_code: 429,
            message: "Too Many Requests".to_string(),
            headers: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    /// Rate-limit store tag: `memory` or `redis`.
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Expired-window sweep cadence of the memory store.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub redis: RedisSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            storage_type: "memory".to_string(),
            sweep_interval: Duration::from_secs(300),
            redis: RedisSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
            timeout: Duration::from_secs(3),
        }
    }
}

impl RedisSettings {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

impl Settings {
    /// Loads settings from the given YAML file, with `MUHTAR__`-prefixed
    /// environment variables taking precedence over file values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("MUHTAR").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
