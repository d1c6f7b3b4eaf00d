//! Request metrics with batched ingestion and a JSON snapshot.
//!
//! Per-request observations are pushed onto a bounded channel and applied
//! by a single background task in batches, so histogram updates never
//! contend on the hot path. Gauges and error counts apply directly
//! through the thread-safe prometheus primitives.

use chrono::Utc;
use parking_lot::Mutex;
use prometheus::{
    proto, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const SIZE_BUCKETS: &[f64] = &[100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0];

/// Ingestion buffer capacity and batch flush threshold.
const INGEST_BUFFER: usize = 100;
const BATCH_LIMIT: usize = 100;
const FLUSH_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct RequestEvent {
    method: String,
    path: String,
    status: String,
    duration: Duration,
    size: u64,
}

pub struct MetricsCollector {
    app_name: String,
    registry: Registry,
    errors_total: IntCounterVec,
    active_requests: IntGauge,
    queue_size: GaugeVec,
    tx: Mutex<Option<mpsc::Sender<RequestEvent>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(namespace: &str, app_name: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
                .namespace(namespace)
                .buckets(DURATION_BUCKETS.to_vec()),
            &["app", "method", "path", "status"],
        )?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests").namespace(namespace),
            &["app", "method", "path", "status"],
        )?;

        let response_size = HistogramVec::new(
            HistogramOpts::new("response_size_bytes", "Response size in bytes")
                .namespace(namespace)
                .buckets(SIZE_BUCKETS.to_vec()),
            &["app", "method", "path", "status"],
        )?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total number of errors").namespace(namespace),
            &["app", "type", "error", "method"],
        )?;

        let active_requests = IntGauge::with_opts(
            Opts::new("active_requests", "Number of active requests")
                .namespace(namespace)
                .const_label("app", app_name),
        )?;

        let queue_size = GaugeVec::new(
            Opts::new("queue_size", "Current size of the queue").namespace(namespace),
            &["app", "type", "queue"],
        )?;

        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(response_size.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;

        let (tx, rx) = mpsc::channel(INGEST_BUFFER);
        let drain = tokio::spawn(drain_events(
            rx,
            app_name.to_string(),
            requests_total,
            request_duration,
            response_size,
        ));

        Ok(Self {
            app_name: app_name.to_string(),
            registry,
            errors_total,
            active_requests,
            queue_size,
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Enqueues one completed-request observation. Drops the observation
    /// if the ingestion buffer is full or the collector is closed.
    pub fn observe_request(
        &self,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        size: u64,
    ) {
        let Some(tx) = self.tx.lock().as_ref().cloned() else {
            return;
        };
        let event = RequestEvent {
            method: method.to_string(),
            path: path.to_string(),
            status: status.to_string(),
            duration,
            size,
        };
        if tx.try_send(event).is_err() {
            debug!("metrics ingestion buffer full, dropping observation");
        }
    }

    pub fn record_error(&self, error_type: &str, error: &str, method: &str) {
        self.errors_total
            .with_label_values(&[&self.app_name, error_type, error, method])
            .inc();
    }

    /// Increments `active_requests`; the returned guard decrements on drop.
    pub fn start_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.active_requests.inc();
        ActiveRequestGuard {
            collector: Arc::clone(self),
        }
    }

    pub fn observe_queue_size(&self, queue: &str, size: f64) {
        self.queue_size
            .with_label_values(&[&self.app_name, "queue_size", queue])
            .set(size);
    }

    /// Renders the JSON snapshot served by the metrics endpoint.
    pub fn snapshot(&self) -> Value {
        let families = self.registry.gather();

        json!({
            "app_name": self.app_name,
            "timestamp": Utc::now(),
            "metrics": {
                "request_duration": histogram_json(family(&families, "request_duration_seconds")),
                "requests_total": counter_json(family(&families, "requests_total")),
                "response_size": histogram_json(family(&families, "response_size_bytes")),
                "errors_total": counter_json(family(&families, "errors_total")),
                "active_requests": gauge_value(family(&families, "active_requests")),
                "queue_size": gauge_json(family(&families, "queue_size")),
            },
        })
    }

    /// Stops the drain task after one final batch.
    pub async fn close(&self) {
        self.tx.lock().take();
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub struct ActiveRequestGuard {
    collector: Arc<MetricsCollector>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.collector.active_requests.dec();
    }
}

async fn drain_events(
    mut rx: mpsc::Receiver<RequestEvent>,
    app_name: String,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    response_size: HistogramVec,
) {
    let mut batch: Vec<RequestEvent> = Vec::with_capacity(BATCH_LIMIT);
    let mut ticker = tokio::time::interval(FLUSH_TICK);

    let apply = |batch: &mut Vec<RequestEvent>| {
        for event in batch.drain(..) {
            let labels = [
                app_name.as_str(),
                event.method.as_str(),
                event.path.as_str(),
                event.status.as_str(),
            ];
            requests_total.with_label_values(&labels).inc();
            request_duration
                .with_label_values(&labels)
                .observe(event.duration.as_secs_f64());
            response_size
                .with_label_values(&labels)
                .observe(event.size as f64);
        }
    };

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= BATCH_LIMIT {
                        apply(&mut batch);
                    }
                }
                None => {
                    apply(&mut batch);
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    apply(&mut batch);
                }
            }
        }
    }
}

fn family<'a>(
    families: &'a [proto::MetricFamily],
    name: &str,
) -> Option<&'a proto::MetricFamily> {
    families.iter().find(|mf| mf.get_name().ends_with(name))
}

fn label_key(metric: &proto::Metric) -> String {
    metric
        .get_label()
        .iter()
        .map(|pair| format!("{}={}", pair.get_name(), pair.get_value()))
        .collect::<Vec<_>>()
        .join(",")
}

fn histogram_json(family: Option<&proto::MetricFamily>) -> Value {
    let mut out = Map::new();
    let Some(family) = family else {
        return Value::Object(out);
    };

    let mut sum = 0.0;
    let mut count = 0u64;
    for metric in family.get_metric() {
        let histogram = metric.get_histogram();
        for bucket in histogram.get_bucket() {
            let key = format!("bucket_{:.2}", bucket.get_upper_bound());
            let cumulative = out.get(&key).and_then(Value::as_u64).unwrap_or(0);
            out.insert(key, json!(cumulative + bucket.get_cumulative_count()));
        }
        sum += histogram.get_sample_sum();
        count += histogram.get_sample_count();
    }
    out.insert("sum".to_string(), json!(sum));
    out.insert("count".to_string(), json!(count));
    Value::Object(out)
}

fn counter_json(family: Option<&proto::MetricFamily>) -> Value {
    let mut out = Map::new();
    if let Some(family) = family {
        for metric in family.get_metric() {
            out.insert(label_key(metric), json!(metric.get_counter().get_value()));
        }
    }
    Value::Object(out)
}

fn gauge_json(family: Option<&proto::MetricFamily>) -> Value {
    let mut out = Map::new();
    if let Some(family) = family {
        for metric in family.get_metric() {
            out.insert(label_key(metric), json!(metric.get_gauge().get_value()));
        }
    }
    Value::Object(out)
}

fn gauge_value(family: Option<&proto::MetricFamily>) -> f64 {
    family
        .and_then(|mf| mf.get_metric().first())
        .map(|metric| metric.get_gauge().get_value())
        .unwrap_or(0.0)
}
