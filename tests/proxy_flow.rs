//! End-to-end exercises of the proxy pipeline over a mock upstream.

mod common;

use common::{gateway_settings, send, spawn_gateway, spawn_upstream, wait_for_records};
use http::Method;
use muhtar::config::ServiceTransform;
use muhtar::model::ProcessType;
use std::fs;
use std::time::Duration;

#[tokio::test]
async fn forwards_and_records_both_directions() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(gateway_settings(upstream)).await;

    let (status, headers, body) = send(gateway.addr, Method::GET, "/foo", &[], "").await;

    assert_eq!(status, 200);
    assert_eq!(&body[..], b"backend response");
    assert_eq!(headers.get("x-upstream").unwrap(), "yes");

    // Security header injection on the response side.
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(
        headers.get("content-security-policy").unwrap(),
        "default-src 'self'"
    );

    wait_for_records(&gateway.repository, 2).await;

    assert_eq!(gateway.repository.count_by_type(ProcessType::Request), 1);
    assert_eq!(gateway.repository.count_by_type(ProcessType::Response), 1);

    let records = gateway
        .repository
        .by_trace(first_trace(&gateway.repository));
    let request = &records[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/foo");
    assert!(request.url.ends_with("/foo"));
    assert!(request.error.is_empty());
    // Correlation pair was applied before the request record was captured.
    assert!(request.headers.contains_key("x-request-id"));
    assert!(request.headers.contains_key("x-correlation-id"));

    let response = &records[1];
    assert_eq!(response.status_code, Some(200));
    assert!(response.timestamp >= request.timestamp);
    assert!(response.response_time.is_some());
    assert_eq!(response.content_length, Some(body.len() as u64));
}

#[tokio::test]
async fn script_transform_reaches_upstream_and_downstream() {
    let upstream = spawn_upstream().await;

    let scripts = tempfile::TempDir::new().expect("scripts dir");
    let auth_dir = scripts.path().join("auth");
    fs::create_dir_all(&auth_dir).expect("auth scripts dir");
    fs::write(
        auth_dir.join("request.rhai"),
        r#"
            request.headers["X-Service"] = "auth";
            request.body.password = "********";
        "#,
    )
    .expect("request script");
    fs::write(
        auth_dir.join("response.rhai"),
        r#"response.headers["X-Transformed"] = "yes";"#,
    )
    .expect("response script");

    let mut settings = gateway_settings(upstream);
    settings.proxy.transform.scripts_dir = scripts.path().to_path_buf();
    settings.proxy.transform.services.insert(
        "auth".to_string(),
        ServiceTransform {
            url: "/auth/login".to_string(),
            service_name: "auth".to_string(),
        },
    );

    let gateway = spawn_gateway(settings).await;

    let (status, headers, body) = send(
        gateway.addr,
        Method::POST,
        "/auth/login",
        &[("content-type", "application/json")],
        r#"{"user":"u","password":"p"}"#,
    )
    .await;

    assert_eq!(status, 200);

    // The upstream echoes what it actually observed.
    let echoed: serde_json::Value = serde_json::from_slice(&body).expect("upstream echo json");
    assert_eq!(echoed["x_service"], "auth");
    assert_eq!(echoed["received"]["user"], "u");
    assert_eq!(echoed["received"]["password"], "********");

    // The response-side script header is visible downstream.
    assert_eq!(headers.get("x-transformed").unwrap(), "yes");
}

#[tokio::test]
async fn multi_valued_response_headers_are_relayed_intact() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(gateway_settings(upstream)).await;

    let (status, headers, _body) = send(gateway.addr, Method::GET, "/cookies", &[], "").await;

    assert_eq!(status, 200);
    let cookies: Vec<&str> = headers
        .get_all("set-cookie")
        .iter()
        .map(|value| value.to_str().unwrap())
        .collect();
    assert_eq!(cookies, vec!["session=abc", "theme=dark"]);
}

#[tokio::test]
async fn upstream_connection_failure_maps_to_bad_gateway() {
    let mut settings = target_down_settings();
    settings.proxy.retry_count = 1;
    settings.proxy.retry_wait_time = Duration::from_millis(10);

    let gateway = spawn_gateway(settings).await;

    let (status, _headers, body) = send(gateway.addr, Method::GET, "/foo", &[], "").await;
    assert_eq!(status, 502);
    let error: serde_json::Value = serde_json::from_slice(&body).expect("error body json");
    assert!(error["error"].is_string());

    wait_for_records(&gateway.repository, 2).await;
    let records = gateway
        .repository
        .by_trace(first_trace(&gateway.repository));
    assert_eq!(records.len(), 2);
    assert!(records[0].error.is_empty());
    assert!(!records[1].error.is_empty());
    assert_eq!(records[1].status_code, Some(502));
}

#[tokio::test]
async fn upstream_timeout_maps_to_gateway_timeout() {
    let upstream = spawn_upstream().await;
    let mut settings = gateway_settings(upstream);
    settings.proxy.timeout = Duration::from_millis(200);

    let gateway = spawn_gateway(settings).await;

    let (status, _headers, _body) = send(gateway.addr, Method::GET, "/slow", &[], "").await;
    assert_eq!(status, 504);

    wait_for_records(&gateway.repository, 2).await;
    let records = gateway
        .repository
        .by_trace(first_trace(&gateway.repository));
    assert!(records[1].error.contains("timed out"));
}

#[tokio::test]
async fn metrics_endpoint_is_reserved_and_reports_traffic() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(gateway_settings(upstream)).await;

    for _ in 0..3 {
        let (status, _, _) = send(gateway.addr, Method::GET, "/foo", &[], "").await;
        assert_eq!(status, 200);
    }

    // Let the batched metrics ingestion apply.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, headers, body) = send(gateway.addr, Method::GET, "/metrics", &[], "").await;
    assert_eq!(status, 200);
    assert!(headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));

    let snapshot: serde_json::Value = serde_json::from_slice(&body).expect("metrics json");
    assert_eq!(snapshot["app_name"], "muhtar_test");
    let totals = snapshot["metrics"]["requests_total"].as_object().unwrap();
    let entry = totals
        .iter()
        .find(|(key, _)| key.contains("path=/foo"))
        .expect("requests_total entry for /foo");
    assert_eq!(entry.1.as_f64().unwrap(), 3.0);

    // The reserved path itself is not proxied or recorded.
    assert!(totals.keys().all(|key| !key.contains("path=/metrics")));
}

#[tokio::test]
async fn telemetry_burst_is_fully_durable() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(gateway_settings(upstream)).await;

    for _ in 0..50 {
        let (status, _, _) = send(gateway.addr, Method::GET, "/foo", &[], "").await;
        assert_eq!(status, 200);
    }

    wait_for_records(&gateway.repository, 100).await;
    assert_eq!(gateway.repository.count_by_type(ProcessType::Request), 50);
    assert_eq!(gateway.repository.count_by_type(ProcessType::Response), 50);

    // Queue depth gauges settle back to zero after the drain.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let snapshot = gateway.metrics.snapshot();
    let queues = snapshot["metrics"]["queue_size"].as_object().unwrap();
    for (_, depth) in queues {
        assert_eq!(depth.as_f64().unwrap(), 0.0);
    }
}

/// Pulls the trace id of any stored record.
fn first_trace(repository: &muhtar::repository::MemoryRepository) -> muhtar::model::TraceId {
    repository
        .all()
        .first()
        .expect("at least one record")
        .trace_id
}

/// Settings pointing at a port that refuses connections.
fn target_down_settings() -> muhtar::config::Settings {
    let mut settings = muhtar::config::Settings::default();
    settings.proxy.target = "http://127.0.0.1:1".to_string();
    settings
}
