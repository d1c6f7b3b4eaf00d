//! Per-request orchestration: capture, transform, forward, relay, record.
//!
//! Every non-reserved path is handled here: the incoming body is captured
//! in full, the scripted transform and header policy run on the way out,
//! the upstream call goes over the pooled client with bounded retries,
//! and both directions are published to the telemetry sink without ever
//! blocking the exchange.

use crate::config::{ProxySettings, Settings};
use crate::metrics::MetricsCollector;
use crate::model::{parse_query_params, Log, ProcessType, TraceId};
use crate::proxy::headers::{self, X_B3_TRACE_ID};
use crate::ratelimit::middleware::client_ip;
use crate::telemetry::LogSink;
use crate::transform::{RequestEnvelope, ResponseEnvelope, ScriptEngine};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// The pooled upstream client type.
pub type HttpClient = Client<HttpConnector, Body>;

/// Largest request or response body captured in full.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error("{scope} body exceeds {limit} bytes")]
    BodyTooLarge { scope: &'static str, limit: usize },

    #[error("failed to read {scope} body: {message}")]
    BodyRead {
        scope: &'static str,
        message: String,
    },

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidTarget(_)
            | ProxyError::BodyTooLarge { .. }
            | ProxyError::BodyRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Per-request orchestrator shared across handlers.
pub struct ProxyService {
    settings: ProxySettings,
    read_timeout: Duration,
    write_timeout: Duration,
    target_base: String,
    client: HttpClient,
    engine: Arc<ScriptEngine>,
    sink: Arc<LogSink>,
    metrics: Arc<MetricsCollector>,
}

impl ProxyService {
    pub fn new(
        settings: &Settings,
        engine: Arc<ScriptEngine>,
        sink: Arc<LogSink>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, ProxyError> {
        let proxy = settings.proxy.clone();

        let target: Uri = proxy
            .target
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(proxy.target.clone()))?;
        if target.authority().is_none() {
            return Err(ProxyError::InvalidTarget(proxy.target.clone()));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(proxy.idle_conn_timeout)
            .pool_max_idle_per_host(proxy.max_idle_conns)
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build_http();

        Ok(Self {
            target_base: proxy.target.trim_end_matches('/').to_string(),
            settings: proxy,
            read_timeout: settings.server.read_timeout,
            write_timeout: settings.server.write_timeout,
            client,
            engine,
            sink,
            metrics,
        })
    }

    /// Handles one proxied exchange end to end. Errors are answered with
    /// a minimal JSON body and still produce a response Log.
    pub async fn handle(self: Arc<Self>, request: Request) -> Response {
        let _active = self.metrics.start_request();
        let started = Instant::now();
        let trace_id = TraceId::generate();

        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let query_params = parse_query_params(parts.uri.query());
        let client_ip = client_ip(&parts.headers, &parts.extensions);
        let user_agent = parts
            .headers
            .get(http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let b3_trace = parts.headers.get(X_B3_TRACE_ID).cloned();
        let target_url = format!("{}{}", self.target_base, path_and_query);

        let body_bytes =
            match capture_body(body, "request", MAX_BODY_SIZE, self.read_timeout).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return self
                        .finish_with_error(
                            e, trace_id, &method, &path, &target_url, &client_ip, &user_agent,
                            started,
                        )
                        .await;
                }
            };

        // Scripted transform, then the static header policy. A failing
        // script leaves the request untransformed.
        let envelope = RequestEnvelope {
            method: method.to_string(),
            path: path.clone(),
            headers: header_map_to_hashmap(&parts.headers),
            body: body_bytes,
        };
        let transformed = match self.engine.transform_request(&envelope) {
            Ok(transformed) => transformed,
            Err(e) => {
                warn!(%e, path = %path, "request transform failed, passing through");
                self.metrics
                    .record_error("transform", &e.to_string(), method.as_str());
                None
            }
        };

        let mut upstream_headers = parts.headers.clone();
        if let Some(transformed) = &transformed {
            apply_transformed_headers(
                &mut upstream_headers,
                &envelope.headers,
                &transformed.headers,
            );
        }
        let request_body = match transformed {
            Some(transformed) => transformed.body,
            None => envelope.body,
        };
        headers::apply_request_policy(&mut upstream_headers);
        // The client derives these from the target URI and rewritten body.
        upstream_headers.remove(http::header::HOST);
        upstream_headers.remove(http::header::CONTENT_LENGTH);

        let mut request_log = Log::new(trace_id, ProcessType::Request);
        request_log.method = method.to_string();
        request_log.url = target_url.clone();
        request_log.path = path.clone();
        request_log.query_params = query_params;
        request_log.headers = header_map_to_hashmap(&upstream_headers);
        request_log.body = request_body.clone();
        request_log.client_ip = client_ip.clone();
        request_log.user_agent = user_agent.clone();
        if self.sink.publish_request(request_log).is_err() {
            debug!("log sink closed, request record dropped");
        }

        let upstream_response = match self
            .forward(&method, &target_url, &upstream_headers, request_body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return self
                    .finish_with_error(
                        e, trace_id, &method, &path, &target_url, &client_ip, &user_agent,
                        started,
                    )
                    .await;
            }
        };

        let (response_parts, upstream_body) = upstream_response.into_parts();
        let response_bytes = match capture_body(
            Body::new(upstream_body),
            "response",
            MAX_BODY_SIZE,
            self.write_timeout,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .finish_with_error(
                        e, trace_id, &method, &path, &target_url, &client_ip, &user_agent,
                        started,
                    )
                    .await;
            }
        };

        let response_envelope = ResponseEnvelope {
            status_code: response_parts.status.as_u16(),
            headers: header_map_to_hashmap(&response_parts.headers),
            body: response_bytes,
        };
        let transformed = match self.engine.transform_response(&path, &response_envelope) {
            Ok(transformed) => transformed,
            Err(e) => {
                warn!(%e, path = %path, "response transform failed, passing through");
                self.metrics
                    .record_error("transform", &e.to_string(), method.as_str());
                None
            }
        };

        let mut downstream_headers = response_parts.headers.clone();
        if let Some(transformed) = &transformed {
            apply_transformed_headers(
                &mut downstream_headers,
                &response_envelope.headers,
                &transformed.headers,
            );
        }
        let response_body = match transformed {
            Some(transformed) => transformed.body,
            None => response_envelope.body,
        };
        headers::apply_response_policy(&mut downstream_headers, b3_trace.as_ref());
        // The relayed body is fully buffered; stale framing headers from
        // the upstream would contradict it.
        downstream_headers.remove(http::header::CONTENT_LENGTH);
        downstream_headers.remove(http::header::TRANSFER_ENCODING);

        let duration = started.elapsed();
        let content_length = response_body.len() as u64;

        let mut response_log = Log::new(trace_id, ProcessType::Response);
        response_log.method = method.to_string();
        response_log.url = target_url;
        response_log.path = path.clone();
        response_log.headers = header_map_to_hashmap(&downstream_headers);
        response_log.body = response_body.clone();
        response_log.client_ip = client_ip;
        response_log.user_agent = user_agent;
        response_log.status_code = Some(response_parts.status.as_u16());
        response_log.response_time = Some(duration);
        response_log.content_length = Some(content_length);
        if self.sink.publish_response(response_log).is_err() {
            debug!("log sink closed, response record dropped");
        }

        self.metrics.observe_request(
            method.as_str(),
            &path,
            response_parts.status.as_u16(),
            duration,
            content_length,
        );

        let mut response = Response::new(Body::from(response_body));
        *response.status_mut() = response_parts.status;
        *response.headers_mut() = downstream_headers;
        response
    }

    /// Sends the upstream request, retrying connection-level failures up
    /// to `retry_count` times with `retry_wait_time` between attempts.
    /// Timeouts and received responses are never retried.
    async fn forward(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<http::Response<hyper::body::Incoming>, ProxyError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(url.to_string()))?;

        let mut attempt = 0u32;
        loop {
            let mut request = http::Request::new(Body::from(body.clone()));
            *request.method_mut() = method.clone();
            *request.uri_mut() = uri.clone();
            *request.headers_mut() = headers.clone();

            match tokio::time::timeout(self.settings.timeout, self.client.request(request)).await
            {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_connect() && attempt < self.settings.retry_count => {
                    attempt += 1;
                    warn!(attempt, %e, "upstream connection failed, retrying");
                    tokio::time::sleep(self.settings.retry_wait_time).await;
                }
                Ok(Err(e)) => return Err(ProxyError::Upstream(e.to_string())),
                Err(_) => return Err(ProxyError::Timeout(self.settings.timeout)),
            }
        }
    }

    /// Error exit shared by every failure point past request capture:
    /// counts the error, publishes the response Log carrying the error
    /// string, observes the metrics, and renders the JSON error response.
    #[allow(clippy::too_many_arguments)]
    async fn finish_with_error(
        &self,
        error: ProxyError,
        trace_id: TraceId,
        method: &Method,
        path: &str,
        target_url: &str,
        client_ip: &str,
        user_agent: &str,
        started: Instant,
    ) -> Response {
        let status = error.status_code();
        let duration = started.elapsed();
        self.metrics
            .record_error("upstream", &error.to_string(), method.as_str());

        let mut response_log = Log::new(trace_id, ProcessType::Response);
        response_log.method = method.to_string();
        response_log.url = target_url.to_string();
        response_log.path = path.to_string();
        response_log.client_ip = client_ip.to_string();
        response_log.user_agent = user_agent.to_string();
        response_log.status_code = Some(status.as_u16());
        response_log.response_time = Some(duration);
        response_log.error = error.to_string();
        if self.sink.publish_response(response_log).is_err() {
            debug!("log sink closed, error record dropped");
        }

        self.metrics
            .observe_request(method.as_str(), path, status.as_u16(), duration, 0);

        error.into_response()
    }
}

/// Axum fallback handler for every non-reserved path.
pub async fn proxy_handler(
    State(service): State<Arc<ProxyService>>,
    request: Request,
) -> Response {
    service.handle(request).await
}

/// Collects a body in full, bounded in size and time.
async fn capture_body(
    body: Body,
    scope: &'static str,
    limit: usize,
    deadline: Duration,
) -> Result<Bytes, ProxyError> {
    let limited = http_body_util::Limited::new(body, limit);
    match tokio::time::timeout(deadline, limited.collect()).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(e)) => {
            if e.is::<http_body_util::LengthLimitError>() {
                Err(ProxyError::BodyTooLarge { scope, limit })
            } else {
                Err(ProxyError::BodyRead {
                    scope,
                    message: e.to_string(),
                })
            }
        }
        Err(_) => Err(ProxyError::BodyRead {
            scope,
            message: format!("timed out after {deadline:?}"),
        }),
    }
}

/// First value per header name; names read back lowercase. This is the
/// script-envelope view of a message, not a faithful copy: multi-valued
/// headers are represented by their first value only.
fn header_map_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    map
}

/// Sets headers a script added or changed onto the real message,
/// overwriting existing values for those names. Entries the script left
/// untouched are skipped, so multi-valued headers the script did not
/// reach for keep every value; removals are not propagated. Names or
/// values a script made unrepresentable in HTTP are skipped.
fn apply_transformed_headers(
    headers: &mut HeaderMap,
    original: &HashMap<String, String>,
    transformed: &HashMap<String, String>,
) {
    for (name, value) in transformed {
        if original.get(name) == Some(value) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}
