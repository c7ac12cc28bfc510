//! tf-config-export CLI
//!
//! Validates a rule configuration, converts it between YAML and JSON, and
//! optionally dry-runs it against a file of sample events.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use tf_cli_common::LogLevel;
use tf_rules::{dry_run, CompiledRuleSet, ExportFormat, RuleConfig};

/// Validate, convert and dry-run rule configurations.
#[derive(Parser, Debug)]
#[command(name = "tf-config-export")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Input configuration file (YAML or JSON)
    #[arg(short, long, default_value = "rules.yaml")]
    input: PathBuf,

    /// Output file (prints to stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "json")]
    format: String,

    /// Dry-run the rules against a JSON file containing an array of events
    #[arg(long)]
    dry_run: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "warn")]
    log_level: LogLevel,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tf_cli_common::init_logging(cli.log_level)?;

    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;

    let config = RuleConfig::parse(&raw).context("failed to parse configuration")?;
    if let Err(errors) = config.validate() {
        bail!("configuration validation failed: {errors}");
    }

    if let Some(events_path) = &cli.dry_run {
        run_dry_run(&config, events_path)?;
        return Ok(());
    }

    let format: ExportFormat = cli.format.parse()?;
    let exported = config.export(format)?;

    match &cli.output {
        Some(path) => {
            std::fs::write(path, &exported)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Configuration exported to {}", path.display());
        }
        None => print!("{exported}"),
    }

    Ok(())
}

fn run_dry_run(config: &RuleConfig, events_path: &PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(events_path)
        .with_context(|| format!("failed to read {}", events_path.display()))?;
    let events: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(&raw).context("sample events must be a JSON array of objects")?;

    let rules = CompiledRuleSet::prepare(config).context("failed to compile rules")?;
    let report = dry_run(&rules, &events);

    println!("Dry run over {} events:", report.total_events);
    println!("  Filtered: {}", report.filtered_count);
    println!("  Passed:   {}", report.passed_count);
    println!("  Rate:     {:.1}%", report.filter_rate * 100.0);
    if !report.rule_hits.is_empty() {
        println!("  Rule hits:");
        for (rule, hits) in &report.rule_hits {
            println!("    {rule}: {hits}");
        }
    }

    Ok(())
}
