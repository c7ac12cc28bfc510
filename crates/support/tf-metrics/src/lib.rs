//! Metrics collection for trailfilter.
//!
//! The pipeline depends on the [`MetricsSink`] capability, not on any
//! concrete backend. [`CloudWatchSink`] buffers data points behind a mutex
//! and flushes in batches of 20 (the PutMetricData maximum), either when the
//! batch fills or on a 10-second tick; [`NopSink`] is used in tests and when
//! metrics are disabled.

use aws_sdk_cloudwatch::primitives::DateTime;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_cloudwatch::Client;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum data points per PutMetricData request; also the auto-flush
/// threshold for the buffer.
const BATCH_SIZE: usize = 20;

/// Interval of the periodic background flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Capability the pipeline records metrics through.
///
/// Implementations must be cheap and non-blocking; the pipeline calls these
/// from its hot loop. Losing metrics on forced shutdown is acceptable,
/// losing them in normal flow is not.
pub trait MetricsSink: Send + Sync {
    /// Records that `count` records passed through the evaluator.
    fn record_processed(&self, count: usize);

    /// Records that `count` records were dropped by the named rule.
    fn record_filtered(&self, count: usize, rule_name: &str);

    /// Records a failure, dimensioned by error kind.
    fn record_error(&self, kind: &str);

    /// Records the wall time spent processing one object.
    fn record_processing_time(&self, duration: Duration);

    /// Records the size of a processed source object.
    fn record_file_size(&self, bytes: u64);

    /// Records how long a configuration load took, dimensioned by source.
    fn record_config_load_time(&self, duration: Duration, source: &str);
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopSink;

impl MetricsSink for NopSink {
    fn record_processed(&self, _count: usize) {}
    fn record_filtered(&self, _count: usize, _rule_name: &str) {}
    fn record_error(&self, _kind: &str) {}
    fn record_processing_time(&self, _duration: Duration) {}
    fn record_file_size(&self, _bytes: u64) {}
    fn record_config_load_time(&self, _duration: Duration, _source: &str) {}
}

struct SinkState {
    client: Client,
    namespace: String,
    default_dimensions: Vec<Dimension>,
    buffer: Mutex<Vec<MetricDatum>>,
}

impl SinkState {
    /// Send all buffered data points in batches of [`BATCH_SIZE`].
    async fn flush(&self) -> Result<(), String> {
        let to_send: Vec<MetricDatum> = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return Ok(());
            }
            buffer.drain(..).collect()
        };

        for batch in to_send.chunks(BATCH_SIZE) {
            self.client
                .put_metric_data()
                .namespace(self.namespace.as_str())
                .set_metric_data(Some(batch.to_vec()))
                .send()
                .await
                .map_err(|e| format!("failed to put metric data: {e}"))?;
        }

        debug!(count = to_send.len(), "flushed metrics to CloudWatch");
        Ok(())
    }
}

/// Buffered CloudWatch metrics sink.
///
/// Data points accumulate in a mutex-guarded buffer. A background task
/// flushes every [`FLUSH_INTERVAL`]; filling a batch triggers an immediate
/// flush. Call [`CloudWatchSink::shutdown`] at teardown for the final flush.
pub struct CloudWatchSink {
    state: Arc<SinkState>,
    stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl CloudWatchSink {
    /// Create a sink publishing into the given namespace and start its
    /// background flusher.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let mut default_dimensions = Vec::new();
        if let Ok(region) = std::env::var("AWS_REGION") {
            if !region.is_empty() {
                default_dimensions.push(dimension("Region", &region));
            }
        }

        let state = Arc::new(SinkState {
            client,
            namespace: namespace.into(),
            default_dimensions,
            buffer: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
        });

        let stop = CancellationToken::new();
        let flusher = tokio::spawn(background_flusher(Arc::clone(&state), stop.clone()));

        Self {
            state,
            stop,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Stop the background flusher and flush any remaining data points.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "metrics flusher task failed");
            }
        }

        if let Err(e) = self.state.flush().await {
            warn!(error = %e, "failed to flush metrics at shutdown");
        }
    }

    /// Flush the buffer immediately.
    pub async fn flush(&self) -> Result<(), String> {
        self.state.flush().await
    }

    /// Number of data points currently buffered.
    pub fn buffered(&self) -> usize {
        self.state.buffer.lock().unwrap().len()
    }

    fn add(&self, datum: MetricDatum) {
        let should_flush = {
            let mut buffer = self.state.buffer.lock().unwrap();
            buffer.push(datum);
            buffer.len() >= BATCH_SIZE
        };

        if should_flush {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = state.flush().await {
                    warn!(error = %e, "failed to auto-flush metrics");
                }
            });
        }
    }

    fn datum(&self, name: &str, value: f64, unit: StandardUnit) -> MetricDatum {
        MetricDatum::builder()
            .metric_name(name)
            .value(value)
            .unit(unit)
            .timestamp(DateTime::from(SystemTime::now()))
            .set_dimensions(Some(self.state.default_dimensions.clone()))
            .build()
    }

    fn datum_with(
        &self,
        name: &str,
        value: f64,
        unit: StandardUnit,
        extra: Dimension,
    ) -> MetricDatum {
        let mut dims = self.state.default_dimensions.clone();
        dims.push(extra);
        MetricDatum::builder()
            .metric_name(name)
            .value(value)
            .unit(unit)
            .timestamp(DateTime::from(SystemTime::now()))
            .set_dimensions(Some(dims))
            .build()
    }
}

impl MetricsSink for CloudWatchSink {
    fn record_processed(&self, count: usize) {
        self.add(self.datum("RecordsProcessed", count as f64, StandardUnit::Count));
    }

    fn record_filtered(&self, count: usize, rule_name: &str) {
        self.add(self.datum_with(
            "RecordsFiltered",
            count as f64,
            StandardUnit::Count,
            dimension("RuleName", rule_name),
        ));
    }

    fn record_error(&self, kind: &str) {
        self.add(self.datum_with(
            "Errors",
            1.0,
            StandardUnit::Count,
            dimension("ErrorType", kind),
        ));
    }

    fn record_processing_time(&self, duration: Duration) {
        self.add(self.datum(
            "ProcessingTime",
            duration.as_secs_f64(),
            StandardUnit::Seconds,
        ));
    }

    fn record_file_size(&self, bytes: u64) {
        self.add(self.datum("FileSize", bytes as f64, StandardUnit::Bytes));
    }

    fn record_config_load_time(&self, duration: Duration, source: &str) {
        self.add(self.datum_with(
            "ConfigLoadTime",
            duration.as_millis() as f64,
            StandardUnit::Milliseconds,
            dimension("ConfigSource", source),
        ));
    }
}

fn dimension(name: &str, value: &str) -> Dimension {
    Dimension::builder().name(name).value(value).build()
}

async fn background_flusher(state: Arc<SinkState>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    // The first tick fires immediately; skip it so the initial flush waits
    // a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = state.flush().await {
                    warn!(error = %e, "failed to flush metrics");
                }
            }
            _ = stop.cancelled() => return,
        }
    }
}
