//! Retry driver with exponential backoff, jitter and cancellation.
//!
//! Wraps any async operation in a bounded retry loop. Backoff grows
//! geometrically from a base delay up to a cap, with optional uniform
//! jitter in [0, 25%) of the computed delay. Sleeps honor a cancellation
//! token so a shutdown never waits out a backoff.
//!
//! Go-style typed and untyped retries collapse into the single generic
//! [`with_retry`]; pass an operation returning `Result<(), E>` for the
//! untyped case.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Substrings of error messages that indicate a transient failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "connection reset",
    "no such host",
    "temporary failure",
    "TooManyRequests",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ThrottlingException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestThrottled",
];

/// Default retryability screen: textual inspection for known-transient
/// substrings in the error message.
pub fn is_transient(message: &str) -> bool {
    TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Geometric growth factor between attempts.
    pub multiplier: f64,
    /// Whether to add uniform jitter in [0, 25%) of the delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the backoff duration for a given attempt.
    ///
    /// `min(max_delay, base_delay * multiplier^attempt * (1 + jitter))`
    /// where jitter is uniform in [0, 0.25) when enabled.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        if self.jitter {
            let jitter_fraction: f64 = rand::rng().random_range(0.0..0.25);
            delay *= 1.0 + jitter_fraction;
        }

        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// How a retried operation ultimately failed.
#[derive(Error, Debug)]
pub enum RetryError<E: std::fmt::Display> {
    /// The error was classified as non-retryable.
    #[error("{0}")]
    Permanent(E),

    /// Every attempt failed; carries the last error.
    #[error("operation failed after {attempts} retries: {source}")]
    Exhausted { attempts: u32, source: E },

    /// Cancelled before or during a backoff sleep.
    #[error("operation cancelled during retry")]
    Cancelled,
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The underlying operation error, if one was recorded.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Permanent(e) | Self::Exhausted { source: e, .. } => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Attempts run until success, a non-retryable error, exhaustion of
/// `config.max_retries`, or cancellation. The `is_retryable` predicate
/// decides which errors are worth another attempt; [`is_transient`] applied
/// to the error's `Display` output is the usual choice.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error: Option<E> = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        "non-retryable error, giving up"
                    );
                    return Err(RetryError::Permanent(e));
                }

                if attempt < config.max_retries {
                    let backoff = config.backoff_duration(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "retryable error, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                }

                last_error = Some(e);
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: config.max_retries,
        source: last_error.expect("at least one attempt must have run"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_retries(5)
            .with_base_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(3.0)
            .with_jitter(false);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.multiplier, 3.0);
        assert!(!config.jitter);
    }

    #[test]
    fn test_backoff_duration_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_duration_capped() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(false);

        assert_eq!(config.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(config.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(config.backoff_duration(10), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(100));

        for _ in 0..100 {
            let d = config.backoff_duration(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(125));
        }
    }

    #[test]
    fn test_is_transient() {
        assert!(is_transient("dial tcp: connection refused"));
        assert!(is_transient("operation timeout while reading body"));
        assert!(is_transient("ThrottlingException: rate exceeded"));
        assert!(is_transient("RequestLimitExceeded"));
        assert!(!is_transient("NoSuchKey: key does not exist"));
        assert!(!is_transient("AccessDenied"));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let config = RetryConfig::new();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<i32, RetryError<String>> =
            with_retry(&config, "test_op", &cancel, |_| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> = with_retry(
            &config,
            "test_op",
            &cancel,
            |e: &String| is_transient(e),
            || {
                let count = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("timeout".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let config = RetryConfig::new();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> = with_retry(
            &config,
            "test_op",
            &cancel,
            |e: &String| is_transient(e),
            || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err("NoSuchKey: key not found".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let config = RetryConfig::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> =
            with_retry(&config, "test_op", &cancel, |_| true, || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 2);
                assert_eq!(source, "timeout");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // Initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(60))
            .with_jitter(false);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<i32, RetryError<String>> =
            with_retry(&config, "test_op", &cancel, |_| true, || async {
                Err("timeout".to_string())
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let config = RetryConfig::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<i32, RetryError<String>> =
            with_retry(&config, "test_op", &cancel, |_| true, || async { Ok(42) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
