//! Runway CLI - migration and operation orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use runway_core::{RecordFilter, RecordState, TaskTimestamp, Time};
use runway_storage::{HistoryStore, JsonHistoryStore};
use runway_execution::{
    FileJobQueue, FileLockProvider, Orchestrator, Outcome, ProcessOptions, RunReport, RunwayConfig,
    StrategyKind, WorkReport,
};

#[derive(Parser)]
#[command(name = "runway")]
#[command(about = "Run migrations and one-off operations", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./runway.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging and full failure traces
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending migrations and operations
    Process {
        /// Hold the isolation lock for the whole run
        #[arg(long)]
        isolate: bool,
        /// Print the plan without running anything
        #[arg(long)]
        dry_run: bool,
        /// Only tasks at or after this timestamp (YYYY_MM_DD[_HHMMSS])
        #[arg(long)]
        from: Option<String>,
        /// Re-run tasks that already have history
        #[arg(long)]
        repeat: bool,
        /// Run every task inline
        #[arg(long)]
        sync: bool,
        /// Dispatch every task to the job queue
        #[arg(long = "async")]
        asynchronous: bool,
        /// Queue for dispatched tasks
        #[arg(long)]
        queue: Option<String>,
        /// Only operations carrying one of these tags
        #[arg(long = "tags", value_delimiter = ',')]
        tags: Vec<String>,
        /// sequential, batch, transactional-batch, allowed-to-fail-batch,
        /// dependency-wave or scheduled
        #[arg(long)]
        strategy: Option<StrategyKind>,
        /// Record tasks as completed without running them
        #[arg(long)]
        fake: bool,
    },
    /// List execution history
    Status {
        /// Filter by state (queued, running, completed, failed, skipped, rolled_back)
        #[arg(long)]
        state: Option<String>,
        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
        /// Filter by task name
        #[arg(long)]
        name: Option<String>,
        /// Created at or after (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Created before (YYYY-MM-DD includes that day, or RFC 3339)
        #[arg(long)]
        until: Option<String>,
    },
    /// Run due jobs from a queue
    Work {
        /// Queue to drain (defaults to the configured default queue)
        #[arg(long)]
        queue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = RunwayConfig::discover(cli.config.as_deref())?;
    debug!("Loaded configuration: {:?}", config);

    let history: Arc<dyn HistoryStore> = Arc::new(
        JsonHistoryStore::new(config.history_dir())
            .await
            .with_context(|| format!("opening history at {}", config.history_dir().display()))?,
    );

    match cli.command {
        Commands::Process {
            isolate,
            dry_run,
            from,
            repeat,
            sync,
            asynchronous,
            queue,
            tags,
            strategy,
            fake,
        } => {
            let from = from
                .map(|s| TaskTimestamp::parse_floor(&s))
                .transpose()
                .context("invalid --from")?;
            let options = ProcessOptions {
                strategy: strategy.unwrap_or(config.strategy),
                isolate,
                dry_run,
                from,
                repeat,
                tags,
                sync,
                asynchronous,
                queue,
                fake,
            };

            let orchestrator = orchestrator(&config, history)?;
            let report = orchestrator.process(&options).await?;
            print_run(&report, cli.verbose);
            Ok(exit_code(report.success()))
        }
        Commands::Status {
            state,
            tag,
            name,
            since,
            until,
        } => {
            let states = match state {
                Some(s) => Some(vec![
                    RecordState::parse(&s).with_context(|| format!("unknown state '{}'", s))?,
                ]),
                None => None,
            };
            let filter = RecordFilter {
                states,
                name,
                tags: tag.map(|t| vec![t]),
                since: since.map(|s| parse_time(&s, false)).transpose()?,
                until: until.map(|s| parse_time(&s, true)).transpose()?,
            };
            let records = history.list(&filter).await?;

            println!("Records ({})", records.len());
            for record in records {
                println!(
                    "  {} | {:<11} | {:<5} | {} | {}",
                    record.id,
                    record.state(),
                    record.record_type,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.name,
                );
                if let Some(reason) = &record.skip_reason {
                    println!("      skipped: {}", reason);
                }
                if cli.verbose {
                    for error in history.errors_for(record.id).await? {
                        println!("      [{}] {}", error.kind, error.message);
                        if !error.trace.is_empty() {
                            println!("{}", indent(&error.trace, 8));
                        }
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Work { queue } => {
            let queue = queue.unwrap_or_else(|| config.default_queue.clone());
            let orchestrator = orchestrator(&config, history)?;
            let report = orchestrator.work(&queue).await?;
            print_work(&report);
            Ok(exit_code(report.success()))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("RUNWAY_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn orchestrator(config: &RunwayConfig, history: Arc<dyn HistoryStore>) -> Result<Orchestrator> {
    let locks = FileLockProvider::new(config.lock_dir())?;
    let queue = FileJobQueue::new(config.queue_dir())?;

    Ok(Orchestrator::new(config.sources(), history)
        .with_lock_provider(Arc::new(locks))
        .with_queue(Arc::new(queue))
        .with_config(config.orchestrator_config()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Parse a status date bound. A bare date as an upper bound covers the whole day.
fn parse_time(s: &str, upper: bool) -> Result<Time> {
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}' (expected YYYY-MM-DD or RFC 3339)", s))?;
    let day = if upper { date.succ_opt() } else { Some(date) };
    let time = day.and_then(|d| d.and_hms_opt(0, 0, 0));
    let time = time.with_context(|| format!("invalid date '{}'", s))?;
    Ok(Utc.from_utc_datetime(&time))
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_run(report: &RunReport, verbose: bool) {
    if report.dry_run {
        println!("Dry run ({}): {} task(s) would run", report.strategy, report.planned().len());
        for (i, group) in report.plan.iter().enumerate() {
            println!("  group {}: {}", i, group.join(", "));
        }
    } else if report.tasks.is_empty() {
        println!("Nothing to run");
    } else {
        println!("Run ({})", report.strategy);
        for task in &report.tasks {
            let mut line = format!("  {} | {}", task.name, task.outcome.label());
            if task.rolled_back {
                line.push_str(" (rolled back)");
            }
            if task.tolerated {
                line.push_str(" (tolerated)");
            }
            println!("{}", line);

            match &task.outcome {
                Outcome::Skipped { reason } => println!("      {}", reason),
                Outcome::Failed(failure) => {
                    println!("      [{}] {}", failure.kind, failure.message);
                    if verbose && !failure.trace.is_empty() {
                        println!("{}", indent(&failure.trace, 8));
                    }
                }
                _ => {}
            }
        }
    }

    if !report.deferred.is_empty() {
        println!("Deferred");
        for task in &report.deferred {
            println!("  {} | due {}", task.name, task.due.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    if !report.not_run.is_empty() {
        println!("Not run: {}", report.not_run.join(", "));
    }
    for rollback in &report.rollbacks {
        match &rollback.error {
            Some(error) => println!("  rollback of {} failed: {}", rollback.name, error),
            None => println!("  rolled back {}", rollback.name),
        }
    }
}

fn print_work(report: &WorkReport) {
    println!("Queue {}: {} job(s)", report.queue, report.completed.len());
    for (name, outcome) in &report.completed {
        println!("  {} | {}", name, outcome);
    }
    for rejected in &report.rejected {
        println!("  rejected: {}", rejected);
    }
}
