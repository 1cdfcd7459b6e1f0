//! mssql-etl CLI - configuration-driven SQL Server ETL runner.

use clap::{Parser, Subcommand};
use mssql_etl::progress::{self, snapshot_path};
use mssql_etl::{Config, MigrateError, Orchestrator, ProgressSnapshot, RunStatus, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code of a run that finished with failed queries.
const EXIT_RUN_FAILED: u8 = 1;

/// Exit code of a run stopped by a signal.
const EXIT_PAUSED: u8 = 130;

#[derive(Parser)]
#[command(name = "mssql-etl")]
#[command(about = "Configuration-driven, resumable SQL Server to SQL Server ETL")]
#[command(version)]
struct Cli {
    /// Path to the YAML (or JSON) migration plan
    #[arg(short, long, default_value = "plan.yaml")]
    config: PathBuf,

    /// Directory holding progress snapshots (overrides settings.progress_dir)
    #[arg(long)]
    progress_dir: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration run
    Run,

    /// Resume an interrupted or failed run
    Resume {
        /// Migration id, e.g. migration_20240101_120000_000
        migration_id: String,
    },

    /// Check the plan's queries without connecting
    Validate,

    /// Show the progress of one run
    Status {
        /// Migration id
        migration_id: String,
    },

    /// List recorded runs, newest first
    List,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::List => {
            let dir = progress_dir(&cli)?;
            let runs = progress::list(&dir)?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded in {}", dir.display());
            } else {
                for run in &runs {
                    println!(
                        "  {}  {:<11}  {}/{} queries  {}{}",
                        run.migration_id,
                        run.status,
                        run.counters.completed_queries,
                        run.counters.total_queries,
                        run.updated_at.format("%Y-%m-%d %H:%M:%S"),
                        if run.can_resume() { "  (resumable)" } else { "" }
                    );
                }
            }
        }

        Commands::Status { ref migration_id } => {
            let dir = progress_dir(&cli)?;
            let path = snapshot_path(&dir, migration_id);
            if !path.exists() {
                return Err(MigrateError::State(format!(
                    "no progress file for {} in {}",
                    migration_id,
                    dir.display()
                )));
            }
            let snapshot = ProgressSnapshot::load(&path)?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
        }

        Commands::Validate => {
            let config = load_config(&cli)?;
            let report = Orchestrator::new(config).validate();
            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!(
                    "Plan {} ({})",
                    report.plan_name.as_deref().unwrap_or("<unnamed>"),
                    &report.plan_hash[..12.min(report.plan_hash.len())]
                );
                for check in &report.queries {
                    let mark = if check.valid { "OK" } else { "INVALID" };
                    println!("  {:<8} {}", mark, check.query_id);
                    if let Some(ref message) = check.message {
                        println!("           {}", message);
                    }
                    if !check.unresolved.is_empty() {
                        println!("           unresolved: {}", check.unresolved.join(", "));
                    }
                }
                println!(
                    "  {} dynamic variable(s), {} pre-process group(s), {} post-process group(s)",
                    report.dynamic_variables, report.pre_process_groups, report.post_process_groups
                );
            }
            if !report.is_valid() {
                return Err(MigrateError::validation("plan", "one or more queries are invalid"));
            }
            if !cli.output_json {
                println!("Validation completed successfully");
            }
        }

        Commands::HealthCheck => {
            let config = load_config(&cli)?;
            let statuses = Orchestrator::new(config).health_check().await;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("Health Check Results:");
                for status in &statuses {
                    println!(
                        "  {}: {}",
                        status.database,
                        if status.healthy { "OK" } else { "FAILED" }
                    );
                    if let Some(ref err) = status.message {
                        println!("    Error: {}", err);
                    }
                }
            }
            if let Some(down) = statuses.iter().find(|s| !s.healthy) {
                return Err(MigrateError::connection(
                    &down.database,
                    down.message.as_deref().unwrap_or("health check failed"),
                ));
            }
        }

        Commands::Run => {
            let config = load_config(&cli)?;
            let cancel = setup_signal_handler();
            let summary = Orchestrator::new(config)
                .with_cancellation(cancel)
                .run(None)
                .await?;
            return report_summary(&summary, cli.output_json);
        }

        Commands::Resume { ref migration_id } => {
            let config = load_config(&cli)?;
            let cancel = setup_signal_handler();
            info!("Resuming migration {}", migration_id);
            let summary = Orchestrator::new(config)
                .with_cancellation(cancel)
                .run(Some(migration_id))
                .await?;
            return report_summary(&summary, cli.output_json);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> Result<Config, MigrateError> {
    let mut config = Config::load(&cli.config)?;
    if let Some(ref dir) = cli.progress_dir {
        config.settings.progress_dir = dir.clone();
    }
    info!("Loaded plan from {:?}", cli.config);
    Ok(config)
}

/// `--progress-dir` when given, otherwise the plan's setting.
fn progress_dir(cli: &Cli) -> Result<PathBuf, MigrateError> {
    match cli.progress_dir {
        Some(ref dir) => Ok(dir.clone()),
        None => Ok(load_config(cli)?.settings.progress_dir),
    }
}

fn report_summary(summary: &RunSummary, output_json: bool) -> Result<ExitCode, MigrateError> {
    if output_json {
        println!("{}", summary.to_json()?);
    } else {
        println!("\nMigration {}: {}", summary.migration_id, summary.status);
        println!("  Duration: {:.2}s", summary.duration_seconds);
        println!(
            "  Queries: {} succeeded, {} failed, {} skipped",
            summary.success_count, summary.failure_count, summary.skipped_count
        );
        println!("  Rows inserted: {}", summary.total_processed);
        for result in summary.per_query_results.iter().filter(|r| r.error.is_some()) {
            println!(
                "  {} ({}): {}",
                result.query_id,
                result.status,
                result.error.as_deref().unwrap_or_default()
            );
        }
        println!("  Progress file: {}", summary.progress_file.display());
        if !summary.success {
            println!(
                "\nResume with: mssql-etl resume {}",
                summary.migration_id
            );
        }
    }

    Ok(match summary.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Paused => ExitCode::from(EXIT_PAUSED),
        _ => ExitCode::from(EXIT_RUN_FAILED),
    })
}

fn print_status(snapshot: &ProgressSnapshot) {
    println!("Migration {}", snapshot.migration_id);
    if let Some(ref name) = snapshot.plan_name {
        println!("  Plan: {}", name);
    }
    println!("  Status: {}", snapshot.status);
    if let Some(phase) = snapshot.current_phase {
        println!("  Phase: {}", phase.description());
    }
    println!(
        "  Queries: {}/{} completed, {} failed",
        snapshot.counters.completed_queries,
        snapshot.counters.total_queries,
        snapshot.counters.failed_queries
    );
    println!(
        "  Rows: {}/{}",
        snapshot.counters.processed_rows, snapshot.counters.total_rows
    );
    if snapshot.resume.resume_count > 0 {
        println!("  Resumed: {} time(s)", snapshot.resume.resume_count);
    }
    for (id, query) in &snapshot.queries {
        println!(
            "    {:<24} {:<10} {:>10} rows  retries {}",
            id, query.status, query.inserted_rows, query.retry_count
        );
        if let Some(last) = query.errors.last() {
            println!("      {}: {}", last.kind, last.message);
        }
    }
    if snapshot.can_resume() {
        println!("\nResume with: mssql-etl resume {}", snapshot.migration_id);
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the run on SIGINT or SIGTERM. The run stops between batches and is
/// left PAUSED for `resume`.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Stopping after the current batch...", label);
                    token.cancel();
                });
            }
            Err(e) => warn!("Cannot install {} handler: {}", label, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    cancel_token
}
