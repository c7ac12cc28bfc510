//! Pattern validation and the process-wide compiled-pattern cache.
//!
//! Rule patterns come from operational configuration, so they are treated as
//! untrusted input: a length cap bounds compile and match cost, and a
//! textual screen rejects the well-known exponential-backtracking shapes.
//! The screen is deliberately not semantic - it catches the dangerous
//! shapes without flagging bounded repetitions like `(\d{4})+`.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;
use tracing::warn;

/// Maximum accepted pattern length in characters.
pub const MAX_PATTERN_LENGTH: usize = 1000;

/// Literal shapes known to cause exponential backtracking.
///
/// A pattern containing any of these as a substring is rejected outright.
const DANGEROUS_SHAPES: &[&str] = &[
    r"(.*)+",
    r"(.+)+",
    r"(\w+)*\w*",
    r"(\d+)+",
    r"(.*)*",
    r"([^/]+)+/",
];

/// Why a pattern was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Pattern exceeds [`MAX_PATTERN_LENGTH`]
    #[error("pattern length {0} exceeds maximum of {MAX_PATTERN_LENGTH}")]
    TooLong(usize),

    /// Pattern failed to compile
    #[error("invalid regex pattern: {0}")]
    Invalid(String),

    /// Pattern contains a known exponential-backtracking shape
    #[error("potentially dangerous regex pattern detected")]
    Dangerous,
}

/// Validate a pattern without caching the compiled form.
///
/// Checks, in order: the dangerous-shape screen, the length cap, and
/// compilation.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if contains_dangerous_shape(pattern) {
        warn!(pattern = pattern, "potentially dangerous regex pattern detected");
        return Err(PatternError::Dangerous);
    }

    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(PatternError::TooLong(pattern.len()));
    }

    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| PatternError::Invalid(e.to_string()))
}

fn contains_dangerous_shape(pattern: &str) -> bool {
    DANGEROUS_SHAPES.iter().any(|shape| pattern.contains(shape))
}

/// Process-wide cache of compiled patterns keyed on pattern text.
///
/// The cache is read-mostly: every evaluation snapshot preparation hits it,
/// while inserts only happen the first time a pattern is seen. Lookups take
/// the read lock; a miss upgrades to the write lock and re-checks before
/// compiling, so two racing callers still end up sharing one compiled
/// matcher. Entries are immutable and live for the process.
pub struct PatternCache {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
}

impl PatternCache {
    /// Create an empty cache. Most callers want [`shared_pattern_cache`].
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Return the compiled matcher for a pattern, compiling and caching it
    /// on first sight. The pattern is validated before compilation.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, PatternError> {
        // Fast path: pattern already compiled (read lock)
        {
            let cache = self.patterns.read().unwrap();
            if let Some(re) = cache.get(pattern) {
                return Ok(Arc::clone(re));
            }
        }

        validate_pattern(pattern)?;

        let mut cache = self.patterns.write().unwrap();

        // Double-check in case another thread compiled it while we waited
        if let Some(re) = cache.get(pattern) {
            return Ok(Arc::clone(re));
        }

        let re = Arc::new(Regex::new(pattern).map_err(|e| PatternError::Invalid(e.to_string()))?);
        cache.insert(pattern.to_string(), Arc::clone(&re));
        Ok(re)
    }

    /// Number of distinct patterns currently cached.
    pub fn len(&self) -> usize {
        self.patterns.read().unwrap().len()
    }

    /// Whether the cache holds no patterns.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide pattern cache shared by all compiled rule sets.
pub fn shared_pattern_cache() -> &'static PatternCache {
    static CACHE: OnceLock<PatternCache> = OnceLock::new();
    CACHE.get_or_init(PatternCache::new)
}
