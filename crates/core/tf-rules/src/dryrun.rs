//! Dry-run evaluation of a rule set against sample events.
//!
//! Used by the config-export tool to preview the effect of a configuration
//! before it is deployed: how many events each rule would drop, and the
//! overall filter rate.

use crate::compiled::CompiledRuleSet;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Aggregate statistics from a dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunReport {
    /// Number of sample events evaluated
    pub total_events: usize,

    /// Events that at least one rule dropped
    pub filtered_count: usize,

    /// Events no rule matched
    pub passed_count: usize,

    /// filtered / total (0.0 when there were no events)
    pub filter_rate: f64,

    /// Drop count per rule name
    pub rule_hits: BTreeMap<String, usize>,
}

/// Evaluate every sample event and tally per-rule hits.
pub fn dry_run(rules: &CompiledRuleSet, events: &[Map<String, Value>]) -> DryRunReport {
    let mut rule_hits: BTreeMap<String, usize> = BTreeMap::new();
    let mut filtered_count = 0;

    for event in events {
        if let Some(rule_name) = rules.evaluate(event) {
            filtered_count += 1;
            *rule_hits.entry(rule_name.to_string()).or_insert(0) += 1;
        }
    }

    let total_events = events.len();
    let filter_rate = if total_events > 0 {
        filtered_count as f64 / total_events as f64
    } else {
        0.0
    };

    DryRunReport {
        total_events,
        filtered_count,
        passed_count: total_events - filtered_count,
        filter_rate,
        rule_hits,
    }
}
