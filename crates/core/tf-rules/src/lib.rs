//! Declarative filter rules for audit-log records.
//!
//! A configuration is a versioned list of named rules; each rule is a
//! conjunction of `(field path, regex)` matches. A record is dropped when any
//! rule matches it in full, and kept otherwise.
//!
//! The crate splits the lifecycle into two representations:
//! - [`RuleConfig`] - the parsed, validated form of a YAML/JSON source blob
//! - [`CompiledRuleSet`] - an immutable evaluation snapshot with
//!   pre-compiled patterns shared through a process-wide cache
//!
//! # Example
//!
//! ```
//! use tf_rules::{CompiledRuleSet, RuleConfig};
//!
//! let cfg = RuleConfig::parse(r#"
//! version: "1.0.0"
//! rules:
//!   - name: check_kms
//!     matches:
//!       - field_name: eventSource
//!         regex: "kms.*"
//! "#).unwrap();
//!
//! let compiled = CompiledRuleSet::prepare(&cfg).unwrap();
//! let record = serde_json::from_str(r#"{"eventSource":"kms.amazonaws.com"}"#).unwrap();
//! assert_eq!(compiled.evaluate(&record), Some("check_kms"));
//! ```

mod compiled;
mod dryrun;
mod field;
mod model;
mod pattern;

pub use compiled::{CompiledMatch, CompiledRule, CompiledRuleSet};
pub use dryrun::{dry_run, DryRunReport};
pub use field::{field_value, is_valid_field_path};
pub use model::{
    ConfigMeta, ExportFormat, Match, Rule, RuleConfig, ValidationError, ValidationErrors,
};
pub use pattern::{shared_pattern_cache, validate_pattern, PatternCache, PatternError};
