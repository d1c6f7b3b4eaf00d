//! The uniform telemetry record emitted for every proxied exchange.
//!
//! Each completed request produces two [`Log`] records sharing a
//! [`TraceId`]: one with [`ProcessType::Request`] captured before the
//! upstream call, and one with [`ProcessType::Response`] captured after.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Identifier shared by the request and response records of one exchange.
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |id: &Uuid| id.get_version_num() == 7),
    new_unchecked,
)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Generates a fresh v7 trace identifier.
    pub fn generate() -> Self {
        // SAFETY: Uuid::now_v7 always produces a version-7 UUID.
        unsafe { Self::new_unchecked(Uuid::now_v7()) }
    }
}

/// Which direction of the exchange a [`Log`] record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Request,
    Response,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Request => "request",
            ProcessType::Response => "response",
        }
    }
}

/// One direction of a proxied exchange, as persisted by the repository.
///
/// `status_code`, `response_time`, and `content_length` are only
/// meaningful on response records; `error` is empty on success.
#[derive(Clone, Debug)]
pub struct Log {
    pub id: Uuid,
    pub trace_id: TraceId,
    pub process_type: ProcessType,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub path: String,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub client_ip: String,
    pub user_agent: String,
    pub status_code: Option<u16>,
    pub response_time: Option<Duration>,
    pub content_length: Option<u64>,
    pub error: String,
    pub metadata: Option<serde_json::Value>,
}

impl Log {
    /// Starts a record for the given direction with a fresh row id.
    pub fn new(trace_id: TraceId, process_type: ProcessType) -> Self {
        Self {
            id: Uuid::now_v7(),
            trace_id,
            process_type,
            timestamp: Utc::now(),
            method: String::new(),
            url: String::new(),
            path: String::new(),
            path_params: HashMap::new(),
            query_params: HashMap::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
            client_ip: String::new(),
            user_agent: String::new(),
            status_code: None,
            response_time: None,
            content_length: None,
            error: String::new(),
            metadata: None,
        }
    }
}

/// Splits a raw query string into a first-value-wins parameter map.
pub fn parse_query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(name.to_string())
            .or_insert_with(|| value.to_string());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_is_version_7() {
        let id = TraceId::generate();
        assert_eq!(id.as_ref().get_version_num(), 7);
    }

    #[test]
    fn trace_id_rejects_other_versions() {
        let v4 = Uuid::new_v4();
        assert!(TraceId::try_from(v4).is_err());
    }

    #[test]
    fn request_and_response_share_trace_id() {
        let trace_id = TraceId::generate();
        let request = Log::new(trace_id, ProcessType::Request);
        let response = Log::new(trace_id, ProcessType::Response);

        assert_eq!(request.trace_id.as_ref(), response.trace_id.as_ref());
        assert_ne!(request.id, response.id);
        assert_eq!(request.process_type, ProcessType::Request);
        assert_eq!(response.process_type, ProcessType::Response);
    }

    #[test]
    fn process_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessType::Request).unwrap(),
            "\"request\""
        );
        assert_eq!(ProcessType::Response.as_str(), "response");
    }

    #[test]
    fn parse_query_params_splits_pairs() {
        let params = parse_query_params(Some("a=1&b=two&empty"));
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("two"));
        assert_eq!(params.get("empty").map(String::as_str), Some(""));
    }

    #[test]
    fn parse_query_params_keeps_first_value() {
        let params = parse_query_params(Some("k=first&k=second"));
        assert_eq!(params.get("k").map(String::as_str), Some("first"));
        assert!(parse_query_params(None).is_empty());
    }
}
