//! Static header policy applied on top of the scripted transforms.
//!
//! Requests lose upstream-exposing headers and gain a fresh correlation
//! pair; responses lose internal headers and gain the security set.
//! Header names are stored lowercase by the `http` crate and matched
//! case-insensitively, so B3 tracing headers pass through under their
//! lowercase names; the upstream client's title-case mode produces the
//! wire casing. The request's `x-b3-traceid` is echoed back to the
//! client as `X-Trace-ID`.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_CORRELATION_ID: &str = "x-correlation-id";
pub const X_PROXY_VERSION: &str = "x-proxy-version";
pub const X_TRACE_ID: &str = "x-trace-id";
pub const X_B3_TRACE_ID: &str = "x-b3-traceid";

const PROXY_VERSION: &str = "1.0";

/// Headers that would expose upstream implementation details.
const REQUEST_STRIP: &[&str] = &[
    "server",
    "x-powered-by",
    "x-aspnet-version",
    "x-internal-token",
];

/// Internal and debug headers never relayed to clients.
const RESPONSE_STRIP: &[&str] = &[
    "x-internal-server",
    "x-debug-info",
    "x-aspnet-version",
    "x-powered-by",
    "server",
];

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    ),
    ("content-security-policy", "default-src 'self'"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
];

/// Applies the request-side policy and returns the generated correlation
/// identifier.
pub fn apply_request_policy(headers: &mut HeaderMap) -> Uuid {
    for name in REQUEST_STRIP {
        headers.remove(*name);
    }

    let correlation_id = Uuid::now_v7();
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value.clone());
        headers.insert(HeaderName::from_static(X_CORRELATION_ID), value);
    }
    headers.insert(
        HeaderName::from_static(X_PROXY_VERSION),
        HeaderValue::from_static(PROXY_VERSION),
    );

    correlation_id
}

/// Applies the response-side policy. `b3_trace_id` is the request's
/// `x-b3-traceid`, echoed back as `X-Trace-ID` when present.
pub fn apply_response_policy(headers: &mut HeaderMap, b3_trace_id: Option<&HeaderValue>) {
    for name in RESPONSE_STRIP {
        headers.remove(*name);
    }

    for &(name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    if let Some(trace_id) = b3_trace_id {
        headers.insert(HeaderName::from_static(X_TRACE_ID), trace_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_policy_strips_and_correlates() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx"));
        headers.insert("x-powered-by", HeaderValue::from_static("PHP"));
        headers.insert("x-internal-token", HeaderValue::from_static("s3cret"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let correlation_id = apply_request_policy(&mut headers);

        assert!(headers.get("server").is_none());
        assert!(headers.get("x-powered-by").is_none());
        assert!(headers.get("x-internal-token").is_none());
        assert_eq!(
            headers.get("accept").map(|v| v.to_str().unwrap()),
            Some("application/json")
        );

        let request_id = headers.get(X_REQUEST_ID).unwrap().to_str().unwrap();
        assert_eq!(request_id, correlation_id.to_string());
        assert_eq!(
            headers.get(X_CORRELATION_ID).unwrap().to_str().unwrap(),
            request_id
        );
        assert_eq!(
            headers.get(X_PROXY_VERSION).unwrap().to_str().unwrap(),
            PROXY_VERSION
        );
    }

    #[test]
    fn request_policy_passes_b3_headers_through() {
        let mut headers = HeaderMap::new();
        headers.insert(X_B3_TRACE_ID, HeaderValue::from_static("abc123"));
        headers.insert("x-b3-sampled", HeaderValue::from_static("1"));

        apply_request_policy(&mut headers);

        assert_eq!(
            headers.get(X_B3_TRACE_ID).unwrap().to_str().unwrap(),
            "abc123"
        );
        assert_eq!(headers.get("x-b3-sampled").unwrap().to_str().unwrap(), "1");
    }

    #[test]
    fn response_policy_injects_security_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("kestrel"));
        headers.insert("x-debug-info", HeaderValue::from_static("trace"));

        apply_response_policy(&mut headers, None);

        assert!(headers.get("server").is_none());
        assert!(headers.get("x-debug-info").is_none());
        assert_eq!(
            headers.get("x-content-type-options").unwrap(),
            HeaderValue::from_static("nosniff")
        );
        assert_eq!(
            headers.get("x-frame-options").unwrap(),
            HeaderValue::from_static("DENY")
        );
        assert_eq!(
            headers.get("content-security-policy").unwrap(),
            HeaderValue::from_static("default-src 'self'")
        );
        assert!(headers.get(X_TRACE_ID).is_none());
    }

    #[test]
    fn response_policy_echoes_b3_trace_id() {
        let mut headers = HeaderMap::new();
        let trace = HeaderValue::from_static("abc123");

        apply_response_policy(&mut headers, Some(&trace));

        assert_eq!(headers.get(X_TRACE_ID).unwrap().to_str().unwrap(), "abc123");
    }
}
