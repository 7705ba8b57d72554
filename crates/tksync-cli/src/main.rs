use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tksync_core::{normalize_timestamp, DateRange, SystemClock};
use tksync_sync::{
    connect_store, engine_for, ticker_from_config, BackfillLoader, BackfillOptions, SyncConfig,
    SyncScheduler, TickOutcome, WindowResync,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tksync")]
#[command(about = "Field-service ticket reconciliation engine")]
struct Cli {
    /// YAML config file; overrides TKSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print reports as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync once now, then on every scheduler tick until Ctrl-C.
    Run,
    /// Run a single incremental sync tick.
    Sync,
    /// Insert every source ticket missing from the target.
    Backfill(BackfillArgs),
    /// Re-merge all tickets visited or changed in a date range.
    Resync(ResyncArgs),
    /// Apply pending target schema migrations.
    Migrate,
}

#[derive(Debug, Args)]
struct BackfillArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    max_batches: Option<usize>,
}

#[derive(Debug, Args)]
struct ResyncArgs {
    /// Whole day to resync (defaults to today in source time).
    #[arg(long, conflicts_with_all = ["from", "to"])]
    date: Option<NaiveDate>,
    /// Inclusive start, `YYYY-MM-DD` or `YYYY-MM-DD HH:MM[:SS]`.
    #[arg(long, requires = "to", value_parser = parse_bound)]
    from: Option<NaiveDateTime>,
    /// Exclusive end.
    #[arg(long, requires = "from", value_parser = parse_bound)]
    to: Option<NaiveDateTime>,
}

fn parse_bound(raw: &str) -> Result<NaiveDateTime, String> {
    normalize_timestamp(Some(raw)).ok_or_else(|| format!("unrecognized timestamp {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SyncConfig::load(Some(path))?,
        None => SyncConfig::from_env()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let store = connect_store(&config).await?;
            let engine = Arc::new(engine_for(store, &config)?);
            let mut ticker = ticker_from_config(&config).await?;
            info!(
                cron = %config.sync_cron,
                interval_secs = ?config.sync_interval_secs,
                "scheduler started"
            );
            let stats = SyncScheduler::new(engine)
                .run(ticker.as_mut(), shutdown_signal())
                .await;
            emit(cli.json, &stats, || {
                format!(
                    "scheduler stopped: ticks={} completed={} skipped={} failed={}",
                    stats.ticks_started, stats.completed, stats.skipped, stats.failed
                )
            })?;
        }
        Commands::Sync => {
            let store = connect_store(&config).await?;
            let outcome = engine_for(store, &config)?.run_tick().await?;
            emit(cli.json, &outcome, || match &outcome {
                TickOutcome::Completed(report) => format!(
                    "sync complete: run_id={} candidates={} inserted={} updated={} skipped={} errored={}",
                    report.run_id,
                    report.candidates_found,
                    report.inserted,
                    report.updated,
                    report.skipped,
                    report.errored
                ),
                TickOutcome::Skipped => "sync skipped: another tick is running".to_string(),
            })?;
        }
        Commands::Backfill(args) => {
            let mut options = BackfillOptions::from(&config);
            if let Some(batch_size) = args.batch_size {
                options.batch_size = batch_size;
            }
            if let Some(delay_ms) = args.delay_ms {
                options.delay = Duration::from_millis(delay_ms);
            }
            options.max_batches = args.max_batches;

            let store = connect_store(&config).await?;
            let report = BackfillLoader::new(store, Arc::new(SystemClock), options)
                .run()
                .await?;
            emit(cli.json, &report, || {
                format!(
                    "backfill complete: batches={} selected={} inserted={} skipped={}",
                    report.batches, report.selected, report.inserted, report.skipped
                )
            })?;
        }
        Commands::Resync(args) => {
            let range = resync_range(&args, &config)?;
            let store = connect_store(&config).await?;
            let report = WindowResync::new(store, Arc::new(SystemClock)).run(range).await?;
            emit(cli.json, &report, || {
                format!(
                    "resync complete: range=[{}, {}) selected={} updated={} inserted={} skipped={}",
                    report.range.from,
                    report.range.to,
                    report.selected,
                    report.updated,
                    report.inserted,
                    report.skipped
                )
            })?;
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn resync_range(args: &ResyncArgs, config: &SyncConfig) -> Result<DateRange> {
    if let (Some(from), Some(to)) = (args.from, args.to) {
        return match DateRange::new(from, to) {
            Some(range) => Ok(range),
            None => bail!("--from {from} must be earlier than --to {to}"),
        };
    }
    let day = match args.date {
        Some(day) => day,
        None => config.window_selector()?.source_today(Utc::now()),
    };
    DateRange::day(day).ok_or_else(|| anyhow!("--date {day} is out of range"))
}

fn emit<T, F>(json: bool, report: &T, human: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the ticker ends.
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
