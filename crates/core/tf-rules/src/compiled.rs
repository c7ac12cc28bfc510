//! Immutable evaluation snapshots with pre-compiled patterns.
//!
//! Preparing a snapshot once and sharing it across evaluations avoids
//! per-record regex compilation, which dominates evaluation cost otherwise.
//! Compiled matchers are shared across rules and across snapshots through
//! the process-wide pattern cache.

use crate::field::field_value;
use crate::model::RuleConfig;
use crate::pattern::shared_pattern_cache;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tf_error::ConfigError;

/// A match with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledMatch {
    pub field_name: String,
    pub pattern: Arc<Regex>,
}

/// A rule with all of its matches compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub matches: Vec<CompiledMatch>,
}

impl CompiledRule {
    /// Evaluate this rule against a decoded record.
    ///
    /// The rule matches only when every field check holds: the field must
    /// resolve to a string value and the pattern must match it. An absent
    /// field, or a present non-string value (number, bool, array), makes
    /// the rule fail immediately.
    fn matches(&self, record: &Map<String, Value>) -> bool {
        for m in &self.matches {
            match field_value(record, &m.field_name) {
                Some(Value::String(s)) => {
                    if !m.pattern.is_match(s) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

/// An immutable snapshot of a validated configuration, ready to evaluate.
///
/// Snapshots are deep-immutable once built and are published behind an
/// `Arc`; concurrent evaluations share one snapshot without locking.
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// Compile every pattern in a configuration through the shared cache.
    ///
    /// The configuration should already be validated; compilation errors
    /// here still surface cleanly for callers that skip validation.
    pub fn prepare(cfg: &RuleConfig) -> Result<Self, ConfigError> {
        let cache = shared_pattern_cache();
        let mut rules = Vec::with_capacity(cfg.rules.len());

        for rule in &cfg.rules {
            let mut matches = Vec::with_capacity(rule.matches.len());
            for m in &rule.matches {
                let pattern = cache.get_or_compile(&m.regex).map_err(|e| {
                    ConfigError::Pattern(format!(
                        "failed to compile pattern for rule {}: {e}",
                        rule.name
                    ))
                })?;
                matches.push(CompiledMatch {
                    field_name: m.field_name.clone(),
                    pattern,
                });
            }
            rules.push(CompiledRule {
                name: rule.name.clone(),
                matches,
            });
        }

        Ok(Self { rules })
    }

    /// Evaluate a record against every rule in declared order.
    ///
    /// Returns the name of the first matching rule (meaning the record is
    /// dropped), or `None` when no rule matches and the record is kept.
    /// Evaluation stops at the first matching rule.
    pub fn evaluate(&self, record: &Map<String, Value>) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(record))
            .map(|rule| rule.name.as_str())
    }

    /// Names of all rules in declared order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Number of rules in the snapshot.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the snapshot holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
