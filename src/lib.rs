//! Muhtar - a reverse-proxy API gateway
//!
//! Muhtar fronts a single HTTP upstream and, per request: enforces
//! multi-tier rate limits (route, per-IP, global) over a pluggable
//! counter store, captures both bodies, applies per-service script
//! transforms in both directions, forwards over a pooled transport with
//! bounded retries, records the full exchange into a pluggable
//! repository through a non-blocking batched sink, and exports metrics
//! with a JSON snapshot endpoint at `/metrics`.

pub mod application;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod proxy;
pub mod ratelimit;
pub mod repository;
pub mod telemetry;
pub mod transform;

pub use application::Application;
pub use config::Settings;
pub use error::{Error, Result};
