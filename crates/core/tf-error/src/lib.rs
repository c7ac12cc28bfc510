//! Error types and classification for trailfilter.
//!
//! This crate provides:
//! - [`FilterError`] - Top-level error enum for all pipeline errors
//! - Domain-specific errors ([`ConfigError`], [`SourceError`], [`DecodeError`], [`SinkError`])
//! - [`ErrorCategory`] for retry decision making
//! - Error classification logic based on error type and processing stage

use thiserror::Error;

/// Top-level error type for trailfilter.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Rule configuration errors (parse, schema, pattern validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Source read errors (blob fetch, parameter fetch)
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Record decode errors (malformed JSON, size limits)
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Destination write errors (upload, pipe)
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The encoder task did not finish within its join deadline
    #[error("Pipeline deadline exceeded after {0} seconds")]
    PipelineDeadline(u64),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic errors (wrapped anyhow)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rule configuration errors.
///
/// These are never retried; a bad configuration stays bad until the
/// operator replaces it.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The source blob could not be parsed as YAML/JSON
    #[error("Parse failed: {0}")]
    Parse(String),

    /// Structural validation failed (one message per violation)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Version field is missing or not valid semver
    #[error("Invalid version: {0}")]
    Version(String),

    /// Two rules share a name
    #[error("Duplicate rule name: {0}")]
    DuplicateRule(String),

    /// A match's field path is syntactically invalid
    #[error("Invalid field path: {0}")]
    FieldPath(String),

    /// A match's pattern failed to compile or was flagged as dangerous
    #[error("Invalid pattern: {0}")]
    Pattern(String),
}

/// Source read errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Object or parameter not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access denied by the store
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Read failed for an unspecified reason (possibly transient)
    #[error("Read failed: {0}")]
    Read(String),

    /// Decompression of the source body failed
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// The download attempt exceeded its deadline
    #[error("Download timed out after {0} seconds")]
    Timeout(u64),
}

/// Record decode errors. Fatal for the object being processed.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The document or a record within it is not valid JSON
    #[error("Malformed JSON: {0}")]
    Malformed(String),

    /// The input exceeds the configured size limit
    #[error("Input of {actual} bytes exceeds limit of {limit} bytes")]
    SizeLimit { actual: u64, limit: u64 },

    /// A single record exceeded the maximum line size
    #[error("Record exceeds maximum size of {0} bytes")]
    RecordTooLarge(usize),
}

/// Destination write errors.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Multipart upload failed
    #[error("Upload failed: {0}")]
    Upload(String),

    /// The pipe between the encoder task and the uploader broke
    #[error("Pipe closed: {0}")]
    Pipe(String),

    /// Gzip encoding of the output failed
    #[error("Compression failed: {0}")]
    Compression(String),
}

/// Error classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry with exponential backoff
    ///
    /// Examples: network timeout, S3 throttling, 503
    Transient,

    /// Permanent error - never retry
    ///
    /// Examples: not found, access denied, malformed JSON, bad configuration
    Permanent,
}

/// Processing stage for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Fetching the source object
    Download,

    /// Decoding the record array
    Decode,

    /// Evaluating filter rules against records
    Evaluate,

    /// Gzip-encoding the filtered output
    Encode,

    /// Uploading the filtered object
    Upload,

    /// Loading the rule configuration
    ConfigLoad,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download => write!(f, "Download"),
            Self::Decode => write!(f, "Decode"),
            Self::Evaluate => write!(f, "Evaluate"),
            Self::Encode => write!(f, "Encode"),
            Self::Upload => write!(f, "Upload"),
            Self::ConfigLoad => write!(f, "ConfigLoad"),
        }
    }
}

/// Classifies an error to determine retry behavior.
pub fn classify_error(error: &FilterError, stage: ProcessingStage) -> ErrorCategory {
    match error {
        FilterError::Config(_) => ErrorCategory::Permanent,
        FilterError::Source(e) => classify_source_error(e),
        FilterError::Decode(_) => ErrorCategory::Permanent,
        FilterError::Sink(e) => classify_sink_error(e),
        FilterError::PipelineDeadline(_) => ErrorCategory::Permanent,
        FilterError::Cancelled => ErrorCategory::Permanent,
        FilterError::Other(e) => classify_anyhow_error(e, stage),
    }
}

fn classify_source_error(error: &SourceError) -> ErrorCategory {
    match error {
        SourceError::NotFound(_) => ErrorCategory::Permanent,
        SourceError::AccessDenied(_) => ErrorCategory::Permanent,
        SourceError::Read(_) => ErrorCategory::Transient,
        SourceError::Decompression(_) => ErrorCategory::Permanent,
        SourceError::Timeout(_) => ErrorCategory::Transient,
    }
}

fn classify_sink_error(error: &SinkError) -> ErrorCategory {
    match error {
        SinkError::Upload(_) => ErrorCategory::Transient,
        // A broken pipe means the peer task died; retrying the same
        // attempt cannot revive it, the whole object must be reprocessed.
        SinkError::Pipe(_) => ErrorCategory::Permanent,
        SinkError::Compression(_) => ErrorCategory::Permanent,
    }
}

fn classify_anyhow_error(error: &anyhow::Error, stage: ProcessingStage) -> ErrorCategory {
    let err_string = error.to_string().to_lowercase();

    match stage {
        ProcessingStage::Download | ProcessingStage::ConfigLoad => {
            if err_string.contains("nosuchkey")
                || err_string.contains("404")
                || err_string.contains("accessdenied")
                || err_string.contains("403")
            {
                ErrorCategory::Permanent
            } else {
                ErrorCategory::Transient
            }
        }
        ProcessingStage::Decode | ProcessingStage::Evaluate | ProcessingStage::Encode => {
            ErrorCategory::Permanent
        }
        ProcessingStage::Upload => {
            if err_string.contains("400") || err_string.contains("invalidrequest") {
                ErrorCategory::Permanent
            } else {
                ErrorCategory::Transient
            }
        }
    }
}

/// Result type alias using FilterError.
pub type Result<T> = std::result::Result<T, FilterError>;
