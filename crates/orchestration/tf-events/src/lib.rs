//! Event envelope parsing.
//!
//! Incoming events name the objects to process. Two payload shapes are
//! supported, selected by [`SourceMode`]:
//!
//! - **object-notification**: the store's own notification format, a
//!   `Records` list where each record carries `s3.bucket.name` and
//!   `s3.object.key`
//! - **direct**: the trail notification format,
//!   `{"s3Bucket": "...", "s3ObjectKey": ["key1", "key2"]}`
//!
//! Either shape may additionally arrive wrapped in an SNS envelope
//! (`Records[].Sns.Message` holding the payload as a JSON string); the
//! parser unwraps that transparently. Every shape reduces to a flat list of
//! [`ObjectRef`] tuples for the pipeline.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Which payload shape to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Object-store notification records
    ObjectNotification,

    /// Direct `{s3Bucket, s3ObjectKey[]}` payloads
    Direct,
}

impl std::str::FromStr for SourceMode {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "object-notification" => Ok(Self::ObjectNotification),
            "direct" => Ok(Self::Direct),
            other => Err(EnvelopeError::UnknownMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectNotification => write!(f, "object-notification"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// One object to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// Why a payload could not be parsed.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("unknown source mode: {0}")]
    UnknownMode(String),

    #[error("failed to parse event payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("event payload contained no object references")]
    Empty,
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Records")]
    records: Vec<SnsRecord>,
}

#[derive(Deserialize)]
struct SnsRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Deserialize)]
struct SnsMessage {
    #[serde(rename = "MessageId", default)]
    message_id: String,

    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct ObjectNotification {
    #[serde(rename = "Records")]
    records: Vec<NotificationRecord>,
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Deserialize)]
struct DirectEvent {
    #[serde(rename = "s3Bucket")]
    s3_bucket: String,

    #[serde(rename = "s3ObjectKey", default)]
    s3_object_keys: Vec<String>,
}

/// Parse an event payload into the objects it names.
///
/// SNS-wrapped payloads are detected and unwrapped first; the inner
/// message is then parsed according to `mode`.
pub fn parse_payload(mode: SourceMode, payload: &[u8]) -> Result<Vec<ObjectRef>, EnvelopeError> {
    // SNS wrapping is detected structurally: a Records list whose entries
    // carry an Sns block.
    if let Ok(envelope) = serde_json::from_slice::<SnsEnvelope>(payload) {
        if !envelope.records.is_empty() {
            let mut objects = Vec::new();
            for record in envelope.records {
                debug!(id = %record.sns.message_id, "unwrapping sns message");
                objects.extend(parse_message(mode, record.sns.message.as_bytes())?);
            }
            if objects.is_empty() {
                return Err(EnvelopeError::Empty);
            }
            return Ok(objects);
        }
    }

    let objects = parse_message(mode, payload)?;
    if objects.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    Ok(objects)
}

fn parse_message(mode: SourceMode, payload: &[u8]) -> Result<Vec<ObjectRef>, EnvelopeError> {
    match mode {
        SourceMode::ObjectNotification => {
            let event: ObjectNotification = serde_json::from_slice(payload)?;
            Ok(event
                .records
                .into_iter()
                .map(|r| ObjectRef {
                    bucket: r.s3.bucket.name,
                    key: r.s3.object.key,
                })
                .collect())
        }
        SourceMode::Direct => {
            let event: DirectEvent = serde_json::from_slice(payload)?;
            Ok(event
                .s3_object_keys
                .into_iter()
                .map(|key| ObjectRef {
                    bucket: event.s3_bucket.clone(),
                    key,
                })
                .collect())
        }
    }
}
