//! The proxy pipeline: header policy and per-request orchestration.

pub mod handler;
pub mod headers;

pub use handler::{ProxyError, ProxyService};
