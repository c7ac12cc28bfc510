//! CLI argument definitions for tf-filter.

use clap::{ArgAction, Parser, ValueEnum};
use std::time::Duration;
pub use tf_cli_common::LogLevel;

/// Audit-log filtering worker.
///
/// Reads an event envelope naming one or more source objects, filters each
/// object's records against the configured rules, and writes the surviving
/// records gzip-encoded to the output bucket under the same key.
///
/// ## Examples
///
/// Process a notification payload from a file:
///   tf-filter --output-bucket filtered-trail --event-file event.json
///
/// Process a direct payload from stdin with rules from blob storage:
///   cat event.json | tf-filter --output-bucket filtered-trail \
///     --source-mode direct --config-source blob \
///     --config-bucket ops --config-key rules.yaml
#[derive(Parser, Debug)]
#[command(name = "tf-filter")]
#[command(version, about, long_about = None)]
pub struct Cli {
    // === Input ===
    /// Path to the event envelope JSON ("-" reads stdin)
    #[arg(short = 'e', long, default_value = "-")]
    pub event_file: String,

    /// Payload shape of the event envelope
    #[arg(long, env = "SOURCE_MODE", value_enum, default_value = "object-notification")]
    pub source_mode: SourceModeArg,

    // === Output ===
    /// Destination bucket for filtered objects
    #[arg(short = 'o', long, env = "OUTPUT_BUCKET")]
    pub output_bucket: String,

    /// Download objects via ranged multipart reads and stream-filter them
    #[arg(long, env = "MULTIPART_DOWNLOAD")]
    pub multipart_download: bool,

    // === Broadcast ===
    /// SNS topic ARN to re-publish incoming envelopes to
    #[arg(long, env = "BROADCAST_TOPIC")]
    pub broadcast_topic: Option<String>,

    /// SQS queue URL to re-publish incoming envelopes to
    #[arg(long, env = "BROADCAST_QUEUE")]
    pub broadcast_queue: Option<String>,

    // === Rule configuration ===
    /// Where the rule configuration lives
    #[arg(long, env = "CONFIG_SOURCE", value_enum, default_value = "local")]
    pub config_source: ConfigSourceArg,

    /// Rules file path (config-source = local)
    #[arg(long, env = "CONFIG_FILE", default_value = "./rules.yaml")]
    pub config_file: String,

    /// Rules bucket (config-source = blob)
    #[arg(long, env = "CONFIG_BUCKET")]
    pub config_bucket: Option<String>,

    /// Rules object key (config-source = blob)
    #[arg(long, env = "CONFIG_KEY")]
    pub config_key: Option<String>,

    /// Parameter name (config-source = parameter)
    #[arg(long, env = "CONFIG_PARAMETER")]
    pub config_parameter: Option<String>,

    /// Secret id (config-source = secret)
    #[arg(long, env = "CONFIG_SECRET_ID")]
    pub config_secret_id: Option<String>,

    /// Cache the loaded configuration between objects
    #[arg(long, env = "CONFIG_CACHE_ENABLED", action = ArgAction::Set, default_value = "true")]
    pub config_cache_enabled: bool,

    /// Configuration cache TTL, e.g. "30s", "5m", "1h"
    #[arg(long, env = "CONFIG_REFRESH_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub config_refresh_interval: Duration,

    // === Metrics ===
    /// Publish metrics to CloudWatch
    #[arg(long, env = "METRICS_ENABLED", action = ArgAction::Set, default_value = "true")]
    pub metrics_enabled: bool,

    /// CloudWatch namespace for metrics
    #[arg(long, env = "METRICS_NAMESPACE", default_value = "TrailFilter")]
    pub metrics_namespace: String,

    // === AWS ===
    /// AWS region
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Custom S3 endpoint URL (for LocalStack)
    #[arg(long, env = "TF_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    // === Logging ===
    /// Log level
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "warn")]
    pub log_level: LogLevel,
}

/// Event payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceModeArg {
    /// Object-store notification records
    #[value(name = "object-notification")]
    ObjectNotification,

    /// Direct {s3Bucket, s3ObjectKey[]} payloads
    Direct,
}

impl From<SourceModeArg> for tf_events::SourceMode {
    fn from(arg: SourceModeArg) -> Self {
        match arg {
            SourceModeArg::ObjectNotification => tf_events::SourceMode::ObjectNotification,
            SourceModeArg::Direct => tf_events::SourceMode::Direct,
        }
    }
}

/// Rule configuration sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum ConfigSourceArg {
    Local,
    Blob,
    Parameter,
    Secret,
}

/// Parse durations of the form "30s", "5m", "2h", or plain seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, "s"),
    };

    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;

    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        other => return Err(format!("unknown duration unit: {other}")),
    };

    Ok(Duration::from_secs(seconds))
}
