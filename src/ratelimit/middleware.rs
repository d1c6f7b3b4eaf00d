//! Axum middleware wiring the limiter into the request path.
//!
//! Limited requests are answered with the configured status and message;
//! admitted requests continue downstream. In both cases the rate-limit
//! headers are attached when `rate_limit.response.headers` is enabled.
//! Store failures fail closed (503) unless `rate_limit.fail_open` is set.

use super::RateLimiter;
use crate::config::ResponseSettings;
use crate::metrics::MetricsCollector;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

/// Shared middleware state.
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub response: ResponseSettings,
    pub fail_open: bool,
}

/// Extracts the client IP: `X-Forwarded-For` (first hop), then
/// `X-Real-IP`, then the socket peer address.
pub fn client_ip(headers: &HeaderMap, extensions: &http::Extensions) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        return real_ip.trim().to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = client_ip(request.headers(), request.extensions());

    let result = match state.limiter.allow(&method, &path, &ip).await {
        Ok(result) => result,
        Err(e) => {
            state
                .metrics
                .record_error("rate_limit_store", &e.to_string(), &method);
            if state.fail_open {
                warn!(%e, "rate limit store error, admitting (fail-open)");
                return next.run(request).await;
            }
            error!(%e, "rate limit store error, rejecting (fail-closed)");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "rate limit storage unavailable",
            )
                .into_response();
        }
    };

    if result.limited {
        let status = StatusCode::from_u16(state.response.status_code)
            .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        let mut response = (status, state.response.message.clone()).into_response();
        if state.response.headers {
            response.headers_mut().extend(result.headers);
        }
        return response;
    }

    let mut response = next.run(request).await;
    if state.response.headers {
        response.headers_mut().extend(result.headers);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn request_with_headers(headers: &[(&'static str, &str)]) -> Request {
        let mut request = Request::new(Body::empty());
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, HeaderValue::from_str(value).unwrap());
        }
        request
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let request =
            request_with_headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1"), ("x-real-ip", "10.9.9.9")]);
        assert_eq!(
            client_ip(request.headers(), request.extensions()),
            "203.0.113.9"
        );
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let request = request_with_headers(&[("x-real-ip", "198.51.100.4")]);
        assert_eq!(
            client_ip(request.headers(), request.extensions()),
            "198.51.100.4"
        );
    }

    #[test]
    fn client_ip_uses_socket_peer_last() {
        let mut request = request_with_headers(&[]);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert_eq!(
            client_ip(request.headers(), request.extensions()),
            "127.0.0.1"
        );
    }
}
