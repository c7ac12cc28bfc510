//! Wiring and execution for the tf-filter binary.

use crate::args::{Cli, ConfigSourceArg};
use crate::broadcast::Broadcaster;
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tf_config::{
    BlobConfigLoader, CachedConfigLoader, ConfigLoader, LocalConfigLoader, ParameterConfigLoader,
    SecretConfigLoader,
};
use tf_events::ObjectRef;
use tf_metrics::{CloudWatchSink, MetricsSink, NopSink};
use tf_processor::{BlobStore, BlobStoreConfig, Copier, CopierConfig, ObjectStoreBlobStore};
use tf_rules::CompiledRuleSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use tf_cli_common::init_logging;

/// Totals across every object in the envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub objects_processed: u64,
    pub objects_failed: u64,
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub bytes_uploaded: u64,
}

/// Process every object named by the event envelope.
pub async fn execute(cli: Cli) -> anyhow::Result<RunSummary> {
    let payload = read_event_payload(&cli.event_file).await?;
    let objects = tf_events::parse_payload(cli.source_mode.into(), &payload)
        .context("failed to parse event envelope")?;

    info!(objects = objects.len(), "parsed event envelope");

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(cli.region.clone()))
        .load()
        .await;

    let blob_store = build_blob_store(&cli);
    let loader = build_loader(&cli, &aws_config, Arc::clone(&blob_store))?;
    let metrics = build_metrics(&cli, &aws_config);

    // Re-publish the raw envelope before processing, if configured
    if let Some(broadcaster) = Broadcaster::new(
        &aws_config,
        cli.broadcast_topic.as_deref(),
        cli.broadcast_queue.as_deref(),
    ) {
        broadcaster
            .broadcast(&String::from_utf8_lossy(&payload))
            .await;
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let rules = load_rules(&cli, loader.as_ref(), metrics.as_ref(), &cancel).await?;

    let copier = Copier::new(
        blob_store,
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        CopierConfig::new(cli.output_bucket.clone())
            .with_multipart_download(cli.multipart_download),
    );

    let summary = process_objects(&copier, &objects, &rules, &cancel).await;

    if let Some(sink) = metrics.as_cloudwatch() {
        sink.shutdown().await;
    }

    if summary.objects_failed > 0 {
        bail!(
            "{} of {} objects failed",
            summary.objects_failed,
            objects.len()
        );
    }

    Ok(summary)
}

async fn process_objects(
    copier: &Copier,
    objects: &[ObjectRef],
    rules: &Arc<CompiledRuleSet>,
    cancel: &CancellationToken,
) -> RunSummary {
    let mut summary = RunSummary::default();

    for object in objects {
        match copier
            .copy_with_retry(&object.bucket, &object.key, rules, cancel)
            .await
        {
            Ok(report) => {
                summary.objects_processed += 1;
                summary.records_in += report.records_in as u64;
                summary.records_out += report.records_out as u64;
                summary.records_dropped += report.dropped as u64;
                summary.bytes_uploaded += report.bytes_uploaded;
            }
            Err(e) => {
                warn!(bucket = %object.bucket, key = %object.key, error = %e, "object failed");
                summary.objects_failed += 1;
            }
        }
    }

    summary
}

async fn read_event_payload(event_file: &str) -> anyhow::Result<Vec<u8>> {
    if event_file == "-" {
        use tokio::io::AsyncReadExt;
        let mut payload = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut payload)
            .await
            .context("failed to read event payload from stdin")?;
        Ok(payload)
    } else {
        tokio::fs::read(event_file)
            .await
            .with_context(|| format!("failed to read event file {event_file}"))
    }
}

fn build_blob_store(cli: &Cli) -> Arc<dyn BlobStore> {
    let mut config = BlobStoreConfig::new(cli.region.clone());
    if let Some(endpoint) = &cli.s3_endpoint {
        config = config.with_endpoint(endpoint.clone());
    }
    Arc::new(ObjectStoreBlobStore::new(config))
}

fn build_loader(
    cli: &Cli,
    aws_config: &aws_config::SdkConfig,
    blob_store: Arc<dyn BlobStore>,
) -> anyhow::Result<Arc<dyn ConfigLoader>> {
    let base: Arc<dyn ConfigLoader> = match cli.config_source {
        ConfigSourceArg::Local => Arc::new(LocalConfigLoader::new(cli.config_file.clone())),
        ConfigSourceArg::Blob => {
            let bucket = cli
                .config_bucket
                .as_deref()
                .context("--config-bucket is required when config-source is blob")?;
            let key = cli
                .config_key
                .as_deref()
                .context("--config-key is required when config-source is blob")?;
            Arc::new(BlobConfigLoader::new(blob_store, bucket, key))
        }
        ConfigSourceArg::Parameter => {
            let name = cli
                .config_parameter
                .as_deref()
                .context("--config-parameter is required when config-source is parameter")?;
            Arc::new(ParameterConfigLoader::new(
                aws_sdk_ssm::Client::new(aws_config),
                name,
            ))
        }
        ConfigSourceArg::Secret => {
            let id = cli
                .config_secret_id
                .as_deref()
                .context("--config-secret-id is required when config-source is secret")?;
            Arc::new(SecretConfigLoader::new(
                aws_sdk_secretsmanager::Client::new(aws_config),
                id,
            ))
        }
    };

    if cli.config_cache_enabled {
        Ok(Arc::new(CachedConfigLoader::new(
            base,
            cli.config_refresh_interval,
        )))
    } else {
        Ok(base)
    }
}

/// Metrics handle that remembers its concrete type so teardown can flush.
enum Metrics {
    CloudWatch(CloudWatchSink),
    Nop(NopSink),
}

impl Metrics {
    fn as_cloudwatch(&self) -> Option<&CloudWatchSink> {
        match self {
            Metrics::CloudWatch(sink) => Some(sink),
            Metrics::Nop(_) => None,
        }
    }
}

impl MetricsSink for Metrics {
    fn record_processed(&self, count: usize) {
        match self {
            Metrics::CloudWatch(s) => s.record_processed(count),
            Metrics::Nop(s) => s.record_processed(count),
        }
    }
    fn record_filtered(&self, count: usize, rule_name: &str) {
        match self {
            Metrics::CloudWatch(s) => s.record_filtered(count, rule_name),
            Metrics::Nop(s) => s.record_filtered(count, rule_name),
        }
    }
    fn record_error(&self, kind: &str) {
        match self {
            Metrics::CloudWatch(s) => s.record_error(kind),
            Metrics::Nop(s) => s.record_error(kind),
        }
    }
    fn record_processing_time(&self, duration: Duration) {
        match self {
            Metrics::CloudWatch(s) => s.record_processing_time(duration),
            Metrics::Nop(s) => s.record_processing_time(duration),
        }
    }
    fn record_file_size(&self, bytes: u64) {
        match self {
            Metrics::CloudWatch(s) => s.record_file_size(bytes),
            Metrics::Nop(s) => s.record_file_size(bytes),
        }
    }
    fn record_config_load_time(&self, duration: Duration, source: &str) {
        match self {
            Metrics::CloudWatch(s) => s.record_config_load_time(duration, source),
            Metrics::Nop(s) => s.record_config_load_time(duration, source),
        }
    }
}

fn build_metrics(cli: &Cli, aws_config: &aws_config::SdkConfig) -> Arc<Metrics> {
    if cli.metrics_enabled {
        let client = aws_sdk_cloudwatch::Client::new(aws_config);
        Arc::new(Metrics::CloudWatch(CloudWatchSink::new(
            client,
            cli.metrics_namespace.clone(),
        )))
    } else {
        Arc::new(Metrics::Nop(NopSink))
    }
}

async fn load_rules(
    cli: &Cli,
    loader: &dyn ConfigLoader,
    metrics: &Metrics,
    cancel: &CancellationToken,
) -> anyhow::Result<Arc<CompiledRuleSet>> {
    let started = Instant::now();

    let retry_config = tf_retry::RetryConfig::default();
    let config = tf_retry::with_retry(
        &retry_config,
        "load_configuration",
        cancel,
        |e: &tf_error::FilterError| {
            !matches!(e, tf_error::FilterError::Config(_) | tf_error::FilterError::Cancelled)
        },
        || loader.load(cancel),
    )
    .await
    .with_context(|| format!("failed to load configuration from {}", loader.describe()))?;

    let rules = Arc::new(
        CompiledRuleSet::prepare(&config).context("failed to compile rule configuration")?,
    );

    metrics.record_config_load_time(started.elapsed(), &loader.describe());
    info!(
        loader = %loader.describe(),
        rules = rules.len(),
        version = %config.version,
        "loaded rule configuration"
    );

    Ok(rules)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight work");
            cancel.cancel();
        }
    });
}
