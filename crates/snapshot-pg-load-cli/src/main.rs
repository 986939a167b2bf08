//! snapshot-pg-load CLI - resumable snapshot ingestion into PostgreSQL.

use clap::{Parser, Subcommand};
use snapshot_pg_load::report::{overall_status, IngestReport, PhaseReport, StatusReport};
use snapshot_pg_load::{health_check, Config, EntityKind, LoadError, Orchestrator, Phase};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "snapshot-pg-load")]
#[command(about = "Resumable scholarly snapshot ingestion into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh ingestion run, discarding prior run state
    Start {
        /// Override number of concurrent work units
        #[arg(long)]
        workers: Option<usize>,

        /// Restrict the run to these entity kinds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        kinds: Option<Vec<EntityKind>>,

        /// Decode and route everything into an in-memory store; the
        /// database and persisted state are left untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume an interrupted ingestion run
    Resume {
        /// Override number of concurrent work units
        #[arg(long)]
        workers: Option<usize>,

        /// Continue even if the configuration changed since the run started
        #[arg(long)]
        force: bool,
    },

    /// Show persisted run progress
    Status,

    /// Discard persisted run state (rows in the target are kept)
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Deferred constraint building
    Constraints {
        #[command(subcommand)]
        command: ConstraintCommands,
    },

    /// Check the snapshot directory, the target connection and the state backend
    HealthCheck,
}

#[derive(Subcommand)]
enum ConstraintCommands {
    /// Run one phase: dedup, keys, indexes, foreign-keys, orphans, validation
    RunPhase {
        phase: Phase,

        /// Restrict to these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        scope: Vec<String>,

        /// Export orphan rows to the manifest and delete them from the referencing table
        #[arg(long)]
        quarantine: bool,
    },

    /// Run every remaining phase in order
    RunAll {
        /// Restrict to these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        scope: Vec<String>,

        /// Export orphan rows to the manifest and delete them from the referencing table
        #[arg(long)]
        quarantine: bool,
    },

    /// Show per-phase progress and constraint statuses
    Status,

    /// Forget a phase's progress so it runs again
    ResetPhase { phase: Phase },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, LoadError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let workers = match &cli.command {
        Commands::Start { workers, .. } | Commands::Resume { workers, .. } => *workers,
        _ => None,
    };
    let mut config = Config::load(&cli.config)?
        .with_workers(workers)
        .with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::Start { kinds, dry_run, .. } => {
            if let Some(kinds) = kinds {
                config.source.kinds = kinds;
            }
            config.validate()?;

            let orchestrator = if dry_run {
                Orchestrator::dry_run(config)
            } else {
                Orchestrator::new(config).await?
            }
            .with_cancellation(cancel_token);

            let report = orchestrator.start().await?;
            print_ingest(&report, cli.output_json, if dry_run { "Dry run" } else { "Ingestion" })?;
            Ok(report.status.exit_code())
        }

        Commands::Resume { force, .. } => {
            let orchestrator = Orchestrator::new(config)
                .await?
                .with_cancellation(cancel_token);

            let report = orchestrator.resume(force).await?;
            print_ingest(&report, cli.output_json, "Resumed ingestion")?;
            Ok(report.status.exit_code())
        }

        Commands::Status => {
            let orchestrator = Orchestrator::state_only(config).await?;
            match orchestrator.status().await? {
                Some(status) => print_status(&status, cli.output_json)?,
                None => println!("No run state"),
            }
            Ok(0)
        }

        Commands::Reset { yes } => {
            if !yes {
                return Err(LoadError::Config(
                    "reset discards run state; pass --yes to confirm".to_string(),
                ));
            }
            let orchestrator = Orchestrator::state_only(config).await?;
            if orchestrator.reset().await? {
                println!("Run state cleared");
            } else {
                println!("No run state to clear");
            }
            Ok(0)
        }

        Commands::Constraints { command } => {
            run_constraints(command, config, cancel_token, cli.output_json).await
        }

        Commands::HealthCheck => {
            let result = health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Snapshot root: {} ({})",
                    if result.snapshot_root_exists { "OK" } else { "MISSING" },
                    config.source.snapshot_root.display()
                );
                let found: Vec<&str> = result.kinds_found.iter().map(|k| k.as_str()).collect();
                println!("  Kinds found: {}", found.join(", "));
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref version) = result.target_version {
                    println!("    Version: {}", version);
                }
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!("  State backend: {}", result.state_backend);
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(LoadError::Config("Health check failed".to_string()));
            }
            Ok(0)
        }
    }
}

async fn run_constraints(
    command: ConstraintCommands,
    config: Config,
    cancel_token: CancellationToken,
    output_json: bool,
) -> Result<u8, LoadError> {
    match command {
        ConstraintCommands::RunPhase {
            phase,
            scope,
            quarantine,
        } => {
            let builder = Orchestrator::new(config)
                .await?
                .with_cancellation(cancel_token)
                .constraint_builder();
            let report = builder.run_phase(phase, &scope, quarantine).await?;
            print_phase(&report, output_json)?;
            Ok(report.status.exit_code())
        }

        ConstraintCommands::RunAll { scope, quarantine } => {
            let builder = Orchestrator::new(config)
                .await?
                .with_cancellation(cancel_token)
                .constraint_builder();
            let reports = builder.run_all(&scope, quarantine).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_phase(report, false)?;
                }
            }
            // The worst phase outcome decides the exit code.
            Ok(overall_status(&reports).exit_code())
        }

        ConstraintCommands::Status => {
            let builder = Orchestrator::state_only(config).await?.constraint_builder();
            match builder.status().await? {
                Some(status) => print_status(&status, output_json)?,
                None => println!("No run state"),
            }
            Ok(0)
        }

        ConstraintCommands::ResetPhase { phase } => {
            let builder = Orchestrator::state_only(config).await?.constraint_builder();
            builder.reset_phase(phase).await?;
            println!("Phase {} reset", phase);
            Ok(0)
        }
    }
}

fn print_ingest(report: &IngestReport, output_json: bool, label: &str) -> Result<(), LoadError> {
    if output_json {
        println!("{}", report.to_json()?);
        return Ok(());
    }
    println!("\n{} {}", label, report.status.as_str());
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Units: {}/{} completed, {} failed",
        report.units_completed, report.units_total, report.units_failed
    );
    if report.units_unfinished > 0 {
        println!("  Unfinished units: {}", report.units_unfinished);
    }
    println!(
        "  Records: {} (malformed {}, rejected {}, rows rejected {})",
        report.records, report.malformed, report.rejected, report.rows_rejected
    );
    if report.bulk_fallbacks > 0 {
        println!("  Batches written row by row: {}", report.bulk_fallbacks);
    }
    println!("  Throughput: {} rows/sec", report.rows_per_second);
    for (table, rows) in &report.rows_per_table {
        println!("    {:<32} {}", table, rows);
    }
    for failed in &report.failed_units {
        println!("  Failed: {} - {}", failed.partition, failed.error);
    }
    for mismatch in &report.manifest_mismatches {
        println!(
            "  Manifest mismatch: {} expected {} records, read {}",
            mismatch.partition, mismatch.expected, mismatch.actual
        );
    }
    Ok(())
}

fn print_phase(report: &PhaseReport, output_json: bool) -> Result<(), LoadError> {
    if output_json {
        println!("{}", report.to_json()?);
        return Ok(());
    }
    println!("\nPhase {} {}", report.phase, report.status.as_str());
    println!("  Duration: {:.2}s", report.duration_seconds);
    for item in &report.items {
        match &item.detail {
            Some(detail) => println!("    {:<48} {:?}: {}", item.item, item.outcome, detail),
            None => println!("    {:<48} {:?}", item.item, item.outcome),
        }
    }
    if report.rows_deduplicated > 0 {
        println!(
            "  Deduplicated {} rows in {} key groups",
            report.rows_deduplicated, report.duplicate_groups
        );
    }
    for path in &report.manifests {
        println!("  Orphan manifest: {}", path.display());
    }
    if report.rows_quarantined > 0 {
        println!("  Quarantined rows: {}", report.rows_quarantined);
    }
    Ok(())
}

fn print_status(status: &StatusReport, output_json: bool) -> Result<(), LoadError> {
    if output_json {
        println!("{}", status.to_json()?);
        return Ok(());
    }
    println!("Run {} ({:?}, phase {})", status.run_id, status.status, status.phase);
    println!("  Started: {}", status.started_at);
    println!("  Updated: {}", status.updated_at);
    for (kind, counts) in &status.units {
        println!(
            "  {:<14} {} completed, {} failed, {} pending, {} in progress, {} records",
            kind.as_str(),
            counts.completed,
            counts.failed,
            counts.pending,
            counts.in_progress,
            counts.records
        );
    }
    for failed in &status.failed_units {
        println!("  Failed: {} - {}", failed.partition, failed.error);
    }
    for phase in &status.phases {
        println!("  {:<14} {}/{}", phase.phase.as_str(), phase.completed, phase.total);
        for (item, reason) in &phase.failures {
            println!("    {}: {}", item, reason);
        }
    }
    for (name, constraint) in &status.constraints {
        println!("  {:<48} {}", name, constraint.status);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout stays parseable with --output-json.
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

/// Cancel the returned token on SIGINT or SIGTERM. In-flight units finish
/// their current batch and are left in progress for `resume`.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
            eprintln!("Shutdown timeout elapsed, exiting");
            std::process::exit(i32::from(snapshot_pg_load::error::EXIT_CANCELLED));
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        std::process::exit(i32::from(snapshot_pg_load::error::EXIT_CANCELLED));
    });

    cancel_token
}
