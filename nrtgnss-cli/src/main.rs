//! nrtgnss CLI: cron entry point for the near-real-time GNSS pipeline.
//!
//! Commands:
//! - `acquire`: ledger upkeep and downloads for one category (or all)
//! - `status`: ledger counts per category
//! - `stack`: assemble the normal-equation window for the current session
//! - `consensus`: robust station coordinates from the position archive
//! - `cleanup`: drop old ledger entries
//!
//! Every command writes a JSON run summary next to the other runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use nrtgnss_core::ledger::Category;
use nrtgnss_runner::{Pipeline, PipelineConfig, RunSummary};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nrtgnss", about = "nrtgnss: near-real-time GNSS acquisition and processing pipeline")]
struct Cli {
    /// Pipeline configuration (TOML).
    #[arg(long, global = true, default_value = "nrtgnss.toml")]
    config: PathBuf,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Run as if at this instant (RFC 3339). Defaults to now.
    #[arg(long, global = true)]
    at: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill the ledger and download waiting files.
    Acquire {
        /// hourly_data, daily_data, subhourly_data or meteorological.
        /// Every configured category when omitted.
        #[arg(long)]
        category: Option<Category>,
    },
    /// Report ledger counts per category.
    Status,
    /// Copy the available stacking window into the session scratch directory.
    Stack,
    /// Compute consensus coordinates and write the DNR/ANR files.
    Consensus,
    /// Delete ledger entries older than the retention period.
    Cleanup {
        /// Overrides each category's configured retention.
        #[arg(long)]
        keep_days: Option<u32>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let pipeline = Pipeline::open(config).context("opening pipeline")?;
    let now = cli.at.unwrap_or_else(Utc::now);
    let started = Utc::now();

    let mut summary = match cli.command {
        Commands::Acquire { category } => run_acquire(&pipeline, category, now, started)?,
        Commands::Status => run_status(&pipeline, started)?,
        Commands::Stack => run_stack(&pipeline, now, started)?,
        Commands::Consensus => run_consensus(&pipeline, now, started)?,
        Commands::Cleanup { keep_days } => run_cleanup(&pipeline, now, keep_days, started)?,
    };

    summary.finish(Utc::now());
    let path = summary
        .write(&pipeline.config().paths.runs)
        .context("writing run summary")?;
    info!(run_id = %summary.run_id, path = %path.display(), "run summary written");
    Ok(())
}

fn run_acquire(
    pipeline: &Pipeline,
    category: Option<Category>,
    now: DateTime<Utc>,
    started: DateTime<Utc>,
) -> Result<RunSummary> {
    let categories: Vec<Category> = match category {
        Some(c) => vec![c],
        None => pipeline.config().categories.keys().copied().collect(),
    };
    let mut summary = RunSummary::new(pipeline.run_id(), "acquire", started);
    for category in categories {
        let result = pipeline
            .acquire(category, now)
            .with_context(|| format!("acquiring {category}"))?;
        println!(
            "{:<16} waiting {:>5}  downloaded {:>5} ({} cached)  failed {:>5}  too late {:>5}  in flight {:>3}",
            category.label(),
            result.waiting_before,
            result.downloaded,
            result.cached,
            result.failed,
            result.too_late,
            result.skipped_in_flight,
        );
        if !result.tripped_providers.is_empty() {
            println!("    circuit open: {}", result.tripped_providers.join(" "));
        }
        summary.categories.push(result);
    }
    Ok(summary)
}

fn run_status(pipeline: &Pipeline, started: DateTime<Utc>) -> Result<RunSummary> {
    let status = pipeline.status().context("reading ledger statistics")?;
    for (category, stats) in &status {
        println!(
            "{:<16} total {:>6}  waiting {:>6}  success {:>5.1}%",
            category.label(),
            stats.total,
            stats.waiting(),
            stats.success_rate
        );
        for (state, count) in &stats.by_status {
            println!("    {state:<12} {count:>6}");
        }
    }
    let mut summary = RunSummary::new(pipeline.run_id(), "status", started);
    summary.status = status;
    Ok(summary)
}

fn run_stack(pipeline: &Pipeline, now: DateTime<Utc>, started: DateTime<Utc>) -> Result<RunSummary> {
    let job = pipeline.stack(now).context("assembling stacking window")?;
    println!(
        "session {}: {}/{} files copied to {}",
        job.session,
        job.summary.copied,
        job.summary.requested,
        job.scratch.display()
    );
    for name in &job.summary.missing {
        println!("    missing {name}");
    }
    let mut summary = RunSummary::new(pipeline.run_id(), "stack", started);
    summary.stacking = Some(job);
    Ok(summary)
}

fn run_consensus(pipeline: &Pipeline, now: DateTime<Utc>, started: DateTime<Utc>) -> Result<RunSummary> {
    let job = pipeline.consensus(now).context("computing consensus coordinates")?;
    println!(
        "{} of {} stations accepted; daily {}, combined {} ({} filled from the previous day)",
        job.accepted,
        job.stations_in_window,
        job.daily_file.display(),
        job.combined.path.display(),
        job.combined.filled.len()
    );
    for rejection in &job.rejections {
        println!("    {}: {}", rejection.station, rejection.reason);
    }
    let mut summary = RunSummary::new(pipeline.run_id(), "consensus", started);
    summary.consensus = Some(job);
    Ok(summary)
}

fn run_cleanup(
    pipeline: &Pipeline,
    now: DateTime<Utc>,
    keep_days: Option<u32>,
    started: DateTime<Utc>,
) -> Result<RunSummary> {
    let deleted = pipeline.cleanup(now, keep_days).context("cleaning up ledger")?;
    for (category, n) in &deleted {
        println!("{:<16} deleted {n}", category.label());
    }
    let mut summary = RunSummary::new(pipeline.run_id(), "cleanup", started);
    summary.cleanup = deleted;
    Ok(summary)
}
