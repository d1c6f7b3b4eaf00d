//! Buffered, batched telemetry pipeline.
//!
//! Publishing is a non-blocking handoff onto a bounded queue per
//! direction; a worker pool drains each queue and flushes batches to the
//! repository on size or on a flush tick. Telemetry never affects the
//! request path: overflow drops the record and counts it, batch save
//! errors are logged, counted, and swallowed.

use crate::metrics::MetricsCollector;
use crate::model::Log;
use crate::repository::LogRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Queue capacity per direction.
const QUEUE_CAPACITY: usize = 1000;
/// Queue depth sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Worker flush tick: a partial batch older than this is flushed.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Publishing after [`LogSink::shutdown`] fails with this error.
#[derive(Debug, Error)]
#[error("log sink is shut down")]
pub struct SinkClosed;

/// Asynchronous log sink in front of a [`LogRepository`].
pub struct LogSink {
    repository: Arc<dyn LogRepository>,
    metrics: Arc<MetricsCollector>,
    request_tx: Mutex<Option<flume::Sender<Log>>>,
    response_tx: Mutex<Option<flume::Sender<Log>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl LogSink {
    /// Spawns `workers` drain tasks per direction plus the queue-depth
    /// sampler.
    pub fn new(
        repository: Arc<dyn LogRepository>,
        metrics: Arc<MetricsCollector>,
        workers: usize,
        batch_size: usize,
    ) -> Self {
        let workers = workers.max(1);
        let batch_size = batch_size.max(1);

        let (request_tx, request_rx) = flume::bounded::<Log>(QUEUE_CAPACITY);
        let (response_tx, response_rx) = flume::bounded::<Log>(QUEUE_CAPACITY);

        let mut handles = Vec::with_capacity(workers * 2);
        for (direction, rx) in [("request", &request_rx), ("response", &response_rx)] {
            for _ in 0..workers {
                handles.push(tokio::spawn(drain_queue(
                    rx.clone(),
                    Arc::clone(&repository),
                    Arc::clone(&metrics),
                    batch_size,
                    direction,
                )));
            }
        }

        let sampler = tokio::spawn(sample_queue_depth(
            request_rx,
            response_rx,
            Arc::clone(&metrics),
        ));

        info!(workers, batch_size, "log sink started");

        Self {
            repository,
            metrics,
            request_tx: Mutex::new(Some(request_tx)),
            response_tx: Mutex::new(Some(response_tx)),
            workers: Mutex::new(handles),
            sampler: Mutex::new(Some(sampler)),
        }
    }

    /// Enqueues a request-side record without blocking.
    pub fn publish_request(&self, log: Log) -> Result<(), SinkClosed> {
        self.publish(&self.request_tx, "request", log)
    }

    /// Enqueues a response-side record without blocking.
    pub fn publish_response(&self, log: Log) -> Result<(), SinkClosed> {
        self.publish(&self.response_tx, "response", log)
    }

    fn publish(
        &self,
        tx: &Mutex<Option<flume::Sender<Log>>>,
        queue: &'static str,
        log: Log,
    ) -> Result<(), SinkClosed> {
        let Some(tx) = tx.lock().as_ref().cloned() else {
            return Err(SinkClosed);
        };

        match tx.try_send(log) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                // Dropping beats stalling the hot path.
                warn!(queue, "log queue full, dropping record");
                self.metrics.record_error("log_dropped", queue, "publish");
                Ok(())
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(SinkClosed),
        }
    }

    /// Drains the queues with one final flush per worker, then closes the
    /// repository. Later publishes fail with [`SinkClosed`].
    pub async fn shutdown(&self) {
        info!("log sink draining");
        self.request_tx.lock().take();
        self.response_tx.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }

        if let Some(sampler) = self.sampler.lock().take() {
            sampler.abort();
        }

        self.repository.close().await;
        info!("log sink stopped");
    }
}

async fn drain_queue(
    rx: flume::Receiver<Log>,
    repository: Arc<dyn LogRepository>,
    metrics: Arc<MetricsCollector>,
    batch_size: usize,
    direction: &'static str,
) {
    let mut batch: Vec<Log> = Vec::with_capacity(batch_size);

    loop {
        // Block for the first record of the batch.
        match rx.recv_async().await {
            Ok(log) => batch.push(log),
            Err(flume::RecvError::Disconnected) => break,
        }

        // Fill until the batch is full or the flush tick elapses. The
        // deadline is fixed at the first record so a steady trickle
        // cannot defer the flush.
        let deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                Ok(Ok(log)) => batch.push(log),
                Ok(Err(flume::RecvError::Disconnected)) => break,
                Err(_tick) => break,
            }
        }

        flush(&repository, &metrics, &mut batch, direction).await;
    }

    flush(&repository, &metrics, &mut batch, direction).await;
}

async fn flush(
    repository: &Arc<dyn LogRepository>,
    metrics: &Arc<MetricsCollector>,
    batch: &mut Vec<Log>,
    direction: &'static str,
) {
    if batch.is_empty() {
        return;
    }

    if let Err(e) = repository.save_batch(batch).await {
        error!(%e, direction, count = batch.len(), "failed to save log batch");
        metrics.record_error("log_batch_save", &e.to_string(), "batch");
    }
    batch.clear();
}

async fn sample_queue_depth(
    request_rx: flume::Receiver<Log>,
    response_rx: flume::Receiver<Log>,
    metrics: Arc<MetricsCollector>,
) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        metrics.observe_queue_size("request", request_rx.len() as f64);
        metrics.observe_queue_size("response", response_rx.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessType, TraceId};
    use crate::repository::MemoryRepository;

    fn sink_over_memory(workers: usize, batch_size: usize) -> (LogSink, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::new());
        let metrics = Arc::new(MetricsCollector::new("muhtar", "test").unwrap());
        let sink = LogSink::new(
            Arc::clone(&repository) as Arc<dyn LogRepository>,
            metrics,
            workers,
            batch_size,
        );
        (sink, repository)
    }

    fn pair(trace_id: TraceId) -> (Log, Log) {
        (
            Log::new(trace_id, ProcessType::Request),
            Log::new(trace_id, ProcessType::Response),
        )
    }

    #[tokio::test]
    async fn published_records_reach_the_repository() {
        let (sink, repository) = sink_over_memory(2, 10);

        let trace_id = TraceId::generate();
        let (request, response) = pair(trace_id);
        sink.publish_request(request).unwrap();
        sink.publish_response(response).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let records = repository.by_trace(trace_id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].process_type, ProcessType::Request);
    }

    #[tokio::test]
    async fn burst_is_fully_drained_after_shutdown() {
        let (sink, repository) = sink_over_memory(3, 25);

        for _ in 0..200 {
            let (request, response) = pair(TraceId::generate());
            sink.publish_request(request).unwrap();
            sink.publish_response(response).unwrap();
        }

        sink.shutdown().await;

        assert_eq!(repository.len(), 400);
        assert_eq!(repository.count_by_type(ProcessType::Request), 200);
        assert_eq!(repository.count_by_type(ProcessType::Response), 200);
    }

    #[tokio::test]
    async fn publish_after_shutdown_errors() {
        let (sink, _repository) = sink_over_memory(1, 10);
        sink.shutdown().await;

        let (request, _) = pair(TraceId::generate());
        assert!(sink.publish_request(request).is_err());
    }

    #[tokio::test]
    async fn partial_batches_flush_on_the_tick() {
        let (sink, repository) = sink_over_memory(1, 1000);

        let (request, _) = pair(TraceId::generate());
        sink.publish_request(request).unwrap();

        // Far fewer records than the batch threshold; the tick flushes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(repository.len(), 1);
    }
}
