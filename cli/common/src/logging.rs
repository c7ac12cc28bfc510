//! Tracing setup shared by the binaries.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::LogLevel;

/// Install the global tracing subscriber.
///
/// The base level comes from the `--log-level` flag; when `RUST_LOG` is
/// set, its directives win, so per-module filtering stays available
/// without touching the flag surface. Everything is written to stderr,
/// keeping stdout reserved for exported documents and run summaries.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(level.as_directive()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
