//! Shared utilities for trailfilter CLI binaries.
//!
//! This crate provides common functionality shared between the `tf-filter`
//! and `tf-config-export` CLI applications.

pub mod args;
pub mod format;
pub mod logging;

pub use args::LogLevel;
pub use format::{format_bytes, format_number};
pub use logging::init_logging;
