//! Shared harness: a mock upstream, a fully wired gateway over the
//! in-memory repository, and a plain HTTP client.

use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatusCode};
use axum::response::AppendHeaders;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use muhtar::application::build_router;
use muhtar::config::Settings;
use muhtar::metrics::MetricsCollector;
use muhtar::proxy::ProxyService;
use muhtar::ratelimit::{MemoryStore, RateLimitState, RateLimiter, Store};
use muhtar::repository::{LogRepository, MemoryRepository};
use muhtar::telemetry::LogSink;
use muhtar::transform::ScriptEngine;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// A running gateway instance with its observable internals.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub repository: Arc<MemoryRepository>,
    pub metrics: Arc<MetricsCollector>,
}

/// Mock upstream used as the proxy target.
pub async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/foo",
            get(|| async {
                (
                    AxumStatusCode::OK,
                    [("x-upstream", "yes")],
                    "backend response",
                )
            }),
        )
        .route(
            "/api/v1/users",
            post(|| async { (AxumStatusCode::CREATED, "created") }),
        )
        .route("/api/v1/orders", post(|| async { "ordered" }))
        .route(
            "/auth/login",
            post(|headers: AxumHeaderMap, body: Bytes| async move {
                let received: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                Json(json!({
                    "x_service": headers
                        .get("x-service")
                        .and_then(|value| value.to_str().ok()),
                    "received": received,
                }))
            }),
        )
        .route(
            "/cookies",
            get(|| async {
                (
                    AppendHeaders([("set-cookie", "session=abc"), ("set-cookie", "theme=dark")]),
                    "cookies set",
                )
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                "slow response"
            }),
        )
        .route(
            "/status/{code}",
            get(|Path(code): Path<u16>| async move {
                let status = AxumStatusCode::from_u16(code).unwrap_or(AxumStatusCode::OK);
                (status, "status response")
            }),
        )
        .fallback(|| async { (AxumStatusCode::NOT_FOUND, "upstream miss") });

    serve(app).await
}

/// Wires a gateway over the in-memory repository and serves it on an
/// ephemeral port.
pub async fn spawn_gateway(settings: Settings) -> TestGateway {
    let metrics = Arc::new(MetricsCollector::new("muhtar", "muhtar_test").expect("metrics"));
    let repository = Arc::new(MemoryRepository::new());
    let sink = Arc::new(LogSink::new(
        Arc::clone(&repository) as Arc<dyn LogRepository>,
        Arc::clone(&metrics),
        2,
        10,
    ));
    let engine =
        Arc::new(ScriptEngine::load(&settings.proxy.transform).expect("scripts should load"));
    let proxy = Arc::new(
        ProxyService::new(&settings, engine, Arc::clone(&sink), Arc::clone(&metrics))
            .expect("proxy service"),
    );

    let rate_limit_state = if settings.rate_limit.enabled {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(Duration::from_secs(300)));
        let limiter = Arc::new(
            RateLimiter::new(settings.rate_limit.clone(), store).expect("limiter"),
        );
        Some(Arc::new(RateLimitState {
            limiter,
            metrics: Arc::clone(&metrics),
            response: settings.rate_limit.response.clone(),
            fail_open: settings.rate_limit.fail_open,
        }))
    } else {
        None
    };

    let router = build_router(proxy, rate_limit_state, Arc::clone(&metrics));
    let addr = serve(router).await;

    TestGateway {
        addr,
        repository,
        metrics,
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    addr
}

/// Settings pointing the proxy at the given upstream, everything else on
/// test-friendly defaults.
pub fn gateway_settings(upstream: SocketAddr) -> Settings {
    let mut settings = Settings::default();
    settings.proxy.target = format!("http://{upstream}");
    settings
}

/// Sends one request through the gateway and collects the full response.
pub async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, Bytes) {
    let client: Client<HttpConnector, Body> =
        Client::builder(TokioExecutor::new()).build_http();

    let mut request = http::Request::new(Body::from(body.to_string()));
    *request.method_mut() = method;
    *request.uri_mut() = format!("http://{addr}{path}").parse().expect("request uri");
    for (name, value) in headers {
        request.headers_mut().insert(
            name.parse::<HeaderName>().expect("header name"),
            HeaderValue::from_str(value).expect("header value"),
        );
    }

    let response = client.request(request).await.expect("request should send");
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("response body").to_bytes();
    (parts.status, parts.headers, bytes)
}

/// Waits for the sink to drain into the repository.
pub async fn wait_for_records(repository: &MemoryRepository, expected: usize) {
    for _ in 0..50 {
        if repository.len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "expected {expected} telemetry records, found {} after waiting",
        repository.len()
    );
}
