//! tf-filter CLI
//!
//! Audit-log filtering worker: reads an event envelope naming source
//! objects, filters each object's records against the configured rules,
//! and uploads the survivors to the output bucket.

use clap::Parser;
use tf_cli_common::{format_bytes, format_number};

mod args;
mod broadcast;
mod run;

use args::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // Initialize logging (to stderr, so stdout is clean for output)
    run::init_logging(args.log_level)?;

    let summary = run::execute(args).await?;

    eprintln!();
    eprintln!("Filtering completed:");
    eprintln!(
        "  Objects processed:  {}",
        format_number(summary.objects_processed)
    );
    eprintln!("  Records in:         {}", format_number(summary.records_in));
    eprintln!("  Records out:        {}", format_number(summary.records_out));
    eprintln!(
        "  Records dropped:    {}",
        format_number(summary.records_dropped)
    );
    eprintln!(
        "  Bytes uploaded:     {}",
        format_bytes(summary.bytes_uploaded)
    );

    Ok(())
}
