//! Per-object copy orchestration.
//!
//! A copy downloads one object, filters its records, and uploads the
//! surviving subset gzip-encoded to the output bucket under the same key.
//! Output encoding runs in a spawned encoder task that writes into one half
//! of an in-process pipe while the uploader streams the other half to the
//! destination; the copy succeeds only when the upload completed and the
//! encoder task finished cleanly within its join deadline.

use crate::pipeline::{FilterPipeline, PipelineReport, MAX_MULTIPART_BYTES, MAX_PLAIN_BYTES};
use crate::store::{decompressed_reader, BlobStore, Compression};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tf_error::{
    classify_error, DecodeError, ErrorCategory, FilterError, ProcessingStage, Result, SourceError,
};
use tf_metrics::MetricsSink;
use tf_retry::{RetryConfig, RetryError};
use tf_rules::CompiledRuleSet;
use tokio::io::{AsyncReadExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// In-process pipe capacity between the encoder task and the uploader.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Default deadline for joining the encoder task after the upload returns.
const ENCODER_JOIN_DEADLINE: Duration = Duration::from_secs(30);

/// Copier settings.
#[derive(Debug, Clone)]
pub struct CopierConfig {
    /// Destination bucket for filtered objects
    pub output_bucket: String,

    /// Use the multipart download and streaming pipeline path
    pub multipart_download: bool,

    /// How long to wait for the encoder task after the upload returns
    pub encoder_join_deadline: Duration,

    /// Retry policy for whole-object retries
    pub retry: RetryConfig,
}

impl CopierConfig {
    /// Create a configuration writing into the given bucket.
    pub fn new(output_bucket: impl Into<String>) -> Self {
        Self {
            output_bucket: output_bucket.into(),
            multipart_download: false,
            encoder_join_deadline: ENCODER_JOIN_DEADLINE,
            retry: RetryConfig::default(),
        }
    }

    /// Enable or disable the multipart download path.
    pub fn with_multipart_download(mut self, multipart: bool) -> Self {
        self.multipart_download = multipart;
        self
    }

    /// Override the encoder join deadline.
    pub fn with_encoder_join_deadline(mut self, deadline: Duration) -> Self {
        self.encoder_join_deadline = deadline;
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of one successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    /// Records in the source object
    pub records_in: usize,

    /// Records written to the destination
    pub records_out: usize,

    /// Records removed by the rules
    pub dropped: usize,

    /// Compressed bytes uploaded
    pub bytes_uploaded: u64,
}

/// Copies audit-log objects between buckets, filtering records via rules.
pub struct Copier {
    store: Arc<dyn BlobStore>,
    metrics: Arc<dyn MetricsSink>,
    config: CopierConfig,
}

impl Copier {
    /// Create a copier over a blob store and metrics sink.
    pub fn new(
        store: Arc<dyn BlobStore>,
        metrics: Arc<dyn MetricsSink>,
        config: CopierConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Copy one object, retrying the whole operation on transient failures.
    pub async fn copy_with_retry(
        &self,
        bucket: &str,
        key: &str,
        rules: &Arc<CompiledRuleSet>,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let result = tf_retry::with_retry(
            &self.config.retry,
            "copy_object",
            cancel,
            is_retryable,
            || self.copy(bucket, key, rules, cancel),
        )
        .await;

        match result {
            Ok(report) => Ok(report),
            Err(RetryError::Cancelled) => Err(FilterError::Cancelled),
            Err(RetryError::Permanent(e)) => Err(e),
            Err(RetryError::Exhausted { attempts, source }) => {
                error!(
                    bucket = bucket,
                    key = key,
                    attempts = attempts,
                    error = %source,
                    "copy failed after retries"
                );
                Err(source)
            }
        }
    }

    /// Copy one object once: download, filter, re-compress, upload.
    pub async fn copy(
        &self,
        bucket: &str,
        key: &str,
        rules: &Arc<CompiledRuleSet>,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let started = Instant::now();

        let result = if self.config.multipart_download {
            self.copy_streaming(bucket, key, rules, cancel).await
        } else {
            self.copy_batch(bucket, key, rules, cancel).await
        };

        self.metrics.record_processing_time(started.elapsed());

        match &result {
            Ok(report) => {
                info!(
                    path = format!("{}/{}", self.config.output_bucket, key),
                    input = report.records_in,
                    output = report.records_out,
                    dropped = report.dropped,
                    "file processed"
                );
            }
            Err(e) => {
                self.metrics.record_error(error_kind(e));
                warn!(bucket = bucket, key = key, error = %e, "copy failed");
            }
        }

        result
    }

    /// Batch path: single-shot download, whole-array decode, chunked filter.
    async fn copy_batch(
        &self,
        bucket: &str,
        key: &str,
        rules: &Arc<CompiledRuleSet>,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let body = self.store.get_stream(bucket, key).await?;
        self.metrics.record_file_size(body.size);

        let mut data = Vec::new();
        let mut reader = decompressed_reader(body).take(MAX_PLAIN_BYTES + 1);
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| FilterError::Source(SourceError::Decompression(e.to_string())))?;

        if data.len() as u64 > MAX_PLAIN_BYTES {
            return Err(FilterError::Decode(DecodeError::SizeLimit {
                actual: data.len() as u64,
                limit: MAX_PLAIN_BYTES,
            }));
        }

        let pipeline = FilterPipeline::new(Arc::clone(rules), Arc::clone(&self.metrics));
        let (kept, report) = pipeline.filter_document(&data)?;

        let (report, bytes_uploaded) = self
            .upload_filtered(key, cancel, move |write_half| async move {
                FilterPipeline::encode_records(kept, write_half).await?;
                Ok(report)
            })
            .await?;

        Ok(CopyReport {
            records_in: report.records_in,
            records_out: report.records_out,
            dropped: report.dropped(),
            bytes_uploaded,
        })
    }

    /// Streaming path: multipart download into a buffer, then the record
    /// extractor feeds the evaluator record by record inside the encoder
    /// task.
    async fn copy_streaming(
        &self,
        bucket: &str,
        key: &str,
        rules: &Arc<CompiledRuleSet>,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let (data, compression) = self
            .store
            .get_buffered(bucket, key, MAX_MULTIPART_BYTES)
            .await?;
        self.metrics.record_file_size(data.len() as u64);

        let pipeline = Arc::new(FilterPipeline::new(
            Arc::clone(rules),
            Arc::clone(&self.metrics),
        ));

        let (report, bytes_uploaded) = self
            .upload_filtered(key, cancel, move |write_half| async move {
                let cursor = std::io::Cursor::new(data);
                match compression {
                    Compression::None => {
                        pipeline
                            .filter_stream(BufReader::new(cursor), write_half)
                            .await
                    }
                    Compression::Gzip => {
                        let decoder = async_compression::tokio::bufread::GzipDecoder::new(
                            BufReader::new(cursor),
                        );
                        pipeline
                            .filter_stream(BufReader::new(decoder), write_half)
                            .await
                    }
                }
            })
            .await?;

        Ok(CopyReport {
            records_in: report.records_in,
            records_out: report.records_out,
            dropped: report.dropped(),
            bytes_uploaded,
        })
    }

    /// Run the encoder task against one end of a pipe while uploading the
    /// other end, then join both.
    ///
    /// The encoder task owns the write half; the uploader consumes the read
    /// half. An upload failure drops the read half, which unblocks the
    /// encoder promptly; cancellation aborts both tasks so neither side can
    /// wedge on a full or empty pipe.
    async fn upload_filtered<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        encode: F,
    ) -> Result<(PipelineReport, u64)>
    where
        F: FnOnce(DuplexStream) -> Fut,
        Fut: Future<Output = Result<PipelineReport>> + Send + 'static,
    {
        let (write_half, read_half) = tokio::io::duplex(PIPE_CAPACITY);

        let encoder = tokio::spawn(encode(write_half));

        let upload_fut = self
            .store
            .put_stream(&self.config.output_bucket, key, Box::new(read_half));
        tokio::pin!(upload_fut);

        let upload_result = tokio::select! {
            _ = cancel.cancelled() => {
                encoder.abort();
                return Err(FilterError::Cancelled);
            }
            result = &mut upload_fut => result,
        };

        let encoder_result =
            match tokio::time::timeout(self.config.encoder_join_deadline, encoder).await {
                Err(_) => {
                    return Err(FilterError::PipelineDeadline(
                        self.config.encoder_join_deadline.as_secs(),
                    ))
                }
                Ok(Err(join_error)) => {
                    return Err(FilterError::Other(anyhow::anyhow!(
                        "encoder task failed: {join_error}"
                    )))
                }
                Ok(Ok(result)) => result,
            };

        let bytes_uploaded = upload_result?;
        let report = encoder_result?;
        Ok((report, bytes_uploaded))
    }
}

fn is_retryable(error: &FilterError) -> bool {
    let stage = match error {
        FilterError::Config(_) => ProcessingStage::ConfigLoad,
        FilterError::Source(_) => ProcessingStage::Download,
        FilterError::Decode(_) => ProcessingStage::Decode,
        FilterError::Sink(_) => ProcessingStage::Upload,
        FilterError::Other(_) => ProcessingStage::Download,
        _ => ProcessingStage::Decode,
    };
    classify_error(error, stage) == ErrorCategory::Transient
}

fn error_kind(error: &FilterError) -> &'static str {
    match error {
        FilterError::Config(_) => "Config",
        FilterError::Source(_) => "SourceRead",
        FilterError::Decode(_) => "Decode",
        FilterError::Sink(_) => "SinkWrite",
        FilterError::PipelineDeadline(_) => "PipelineDeadline",
        FilterError::Cancelled => "Cancelled",
        FilterError::Other(_) => "Unknown",
    }
}
