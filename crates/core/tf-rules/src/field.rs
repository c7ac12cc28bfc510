//! Dotted field paths over decoded records.
//!
//! A field path names a scalar inside a nested JSON object, e.g.
//! `userIdentity.sessionContext.sessionIssuer.arn`. Resolution walks the
//! object one segment at a time and only succeeds when the final segment
//! lands on a non-object value.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn segment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("static segment pattern"))
}

/// Resolve a dotted field path against a decoded record.
///
/// Returns `Some(value)` only when every intermediate segment resolves to a
/// nested object and the final segment resolves to a non-object value.
/// An object at the final segment counts as absent, so patterns never match
/// against structured values. Arrays do resolve; the caller decides what to
/// do with a non-string value.
pub fn field_value<'a>(record: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    find(record, path.split('.'))
}

fn find<'a, 'p>(
    obj: &'a Map<String, Value>,
    mut segments: impl Iterator<Item = &'p str>,
) -> Option<&'a Value> {
    let segment = segments.next()?;
    let value = obj.get(segment)?;

    // Descend into nested objects. When the final segment is itself an
    // object, the iterator is exhausted on the next call and resolution
    // fails, which is the intended "object means absent" behavior.
    if let Value::Object(nested) = value {
        return find(nested, segments);
    }

    if segments.next().is_none() {
        Some(value)
    } else {
        None
    }
}

/// Check whether a field path is syntactically valid.
///
/// Each dot-separated segment must start with a letter and continue with
/// letters, digits, underscores or hyphens. Empty segments (leading,
/// trailing or doubled dots) are rejected.
pub fn is_valid_field_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    path.split('.').all(|s| segment_pattern().is_match(s))
}
