//! Fan-out of incoming event envelopes to a topic and/or queue.
//!
//! Downstream consumers sometimes want the raw envelope as well as the
//! filtered objects; when a broadcast topic or queue is configured, the
//! envelope is re-published there verbatim. Broadcast failures are logged
//! and counted but never fail the filtering run.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

fn topic_arn_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^arn:aws[a-zA-Z-]*:sns:[a-z0-9-]+:\d{12}:[a-zA-Z0-9_-]+(\.fifo)?$")
            .expect("static topic arn pattern")
    })
}

fn queue_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https://sqs\.[a-z0-9-]+\.amazonaws\.com/\d{12}/[a-zA-Z0-9_-]+(\.fifo)?$")
            .expect("static queue url pattern")
    })
}

/// Warn about a topic ARN that does not look like one. The value is still
/// used, since custom endpoints and partitions exist.
pub fn validate_topic_arn(arn: &str) {
    if !topic_arn_pattern().is_match(arn) {
        warn!(arn = arn, "broadcast topic ARN has unexpected format, continuing anyway");
    }
}

/// Warn about a queue URL that does not look like one.
pub fn validate_queue_url(url: &str) {
    if !queue_url_pattern().is_match(url) {
        warn!(url = url, "broadcast queue URL has unexpected format, continuing anyway");
    }
}

/// Publishes envelopes to the configured destinations.
pub struct Broadcaster {
    sns: Option<(aws_sdk_sns::Client, String)>,
    sqs: Option<(aws_sdk_sqs::Client, String)>,
}

impl Broadcaster {
    /// Build a broadcaster from the configured topic/queue, if any.
    pub fn new(
        aws_config: &aws_config::SdkConfig,
        topic_arn: Option<&str>,
        queue_url: Option<&str>,
    ) -> Option<Self> {
        if topic_arn.is_none() && queue_url.is_none() {
            return None;
        }

        let sns = topic_arn.map(|arn| {
            validate_topic_arn(arn);
            (aws_sdk_sns::Client::new(aws_config), arn.to_string())
        });
        let sqs = queue_url.map(|url| {
            validate_queue_url(url);
            (aws_sdk_sqs::Client::new(aws_config), url.to_string())
        });

        Some(Self { sns, sqs })
    }

    /// Publish one envelope everywhere configured. Failures are logged,
    /// not propagated.
    pub async fn broadcast(&self, payload: &str) {
        if let Some((client, arn)) = &self.sns {
            match client
                .publish()
                .topic_arn(arn.as_str())
                .message(payload)
                .send()
                .await
            {
                Ok(_) => debug!(topic = %arn, "broadcast to topic"),
                Err(e) => error!(topic = %arn, error = %e, "failed to broadcast to topic"),
            }
        }

        if let Some((client, url)) = &self.sqs {
            match client
                .send_message()
                .queue_url(url.as_str())
                .message_body(payload)
                .send()
                .await
            {
                Ok(_) => debug!(queue = %url, "broadcast to queue"),
                Err(e) => error!(queue = %url, error = %e, "failed to broadcast to queue"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_arn_shapes() {
        assert!(topic_arn_pattern().is_match("arn:aws:sns:us-east-1:123456789012:trail-events"));
        assert!(topic_arn_pattern().is_match("arn:aws:sns:us-east-1:123456789012:events.fifo"));
        assert!(!topic_arn_pattern().is_match("arn:aws:sqs:us-east-1:123456789012:not-a-topic"));
        assert!(!topic_arn_pattern().is_match("garbage"));
    }

    #[test]
    fn test_queue_url_shapes() {
        assert!(queue_url_pattern()
            .is_match("https://sqs.us-east-1.amazonaws.com/123456789012/trail-queue"));
        assert!(queue_url_pattern()
            .is_match("https://sqs.eu-west-2.amazonaws.com/123456789012/trail.fifo"));
        assert!(!queue_url_pattern().is_match("http://example.com/queue"));
    }
}
