// crates/workshop-cli/src/main.rs
// ============================================================================
// Module: Workshop DB CLI Entry Point
// Description: Command dispatcher for schema, snapshot, and serve workflows.
// Purpose: Give operators one binary to migrate, inspect, snapshot, and run
//          the database layer.
// Dependencies: clap, serde_json, tokio, tracing, workshop-cli, workshop-config,
//               workshop-rescue, workshop-store
// ============================================================================

//! ## Overview
//! `workshop-db` loads `workshop.toml` (or `WORKSHOP_CONFIG`) plus the
//! environment overrides, then runs one command. Schema commands open the
//! pool without touching snapshots; snapshot commands never open the pool.
//! `serve` runs the full lifecycle and blocks until a termination signal.
//!
//! The entry point is synchronous: restore and snapshot use blocking HTTP,
//! which must not run inside an async runtime. `serve` drives a small
//! runtime only while it waits for the signal.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;
use workshop_cli::lifecycle::DatabaseSessions;
use workshop_cli::lifecycle::WorkshopRuntime;
use workshop_cli::lifecycle::install_runtime;
use workshop_cli::logging::init_logging;
use workshop_config::WorkshopConfig;
use workshop_rescue::RescueManager;
use workshop_rescue::RescueStatus;
use workshop_rescue::TerminationSignal;
use workshop_rescue::install_signal_handlers;
use workshop_store::DatabaseState;
use workshop_store::MigrationEngine;
use workshop_store::workshop_engine;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Marker accepted by `downgrade --target` to remove every revision.
const BASE_REVISION: &str = "base";

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "workshop-db", version, about = "Workshop database maintenance and runtime")]
struct Cli {
    /// Config file path (defaults to workshop.toml or `WORKSHOP_CONFIG`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade the schema.
    Migrate(MigrateCommand),
    /// Show the recorded schema revision.
    Current,
    /// List the schema history in apply order.
    History,
    /// Remove revisions newer than the target.
    Downgrade(DowngradeCommand),
    /// Record a revision without running it.
    Stamp(StampCommand),
    /// Take a forced snapshot now.
    Snapshot,
    /// Restore the local database from its snapshot if it is absent.
    Restore,
    /// Print snapshot status as JSON.
    Status,
    /// Run the startup lifecycle and wait for a termination signal.
    Serve,
}

/// Arguments for `migrate`.
#[derive(Args, Debug)]
struct MigrateCommand {
    /// Revision to upgrade to (defaults to head).
    #[arg(long, value_name = "REVISION")]
    target: Option<String>,
}

/// Arguments for `downgrade`.
#[derive(Args, Debug)]
struct DowngradeCommand {
    /// Revision to keep (`base` removes everything).
    #[arg(long, value_name = "REVISION")]
    target: String,
}

/// Arguments for `stamp`.
#[derive(Args, Debug)]
struct StampCommand {
    /// Revision to record as the sole head.
    #[arg(long, value_name = "REVISION")]
    revision: String,
}

/// CLI error wrapper for user-facing messages.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

/// JSON body printed by `status`.
#[derive(Debug, Serialize)]
struct StatusReport {
    /// Backend selected by the database URL.
    backend: &'static str,
    /// Snapshot status.
    rescue: RescueStatus,
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Loads configuration and dispatches the command.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = WorkshopConfig::load(cli.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    init_logging(&config.logging).map_err(|err| CliError::new(err.to_string()))?;

    match cli.command {
        Commands::Migrate(command) => command_migrate(&config, &command),
        Commands::Current => command_current(&config),
        Commands::History => command_history(),
        Commands::Downgrade(command) => command_downgrade(&config, &command),
        Commands::Stamp(command) => command_stamp(&config, &command),
        Commands::Snapshot => command_snapshot(&config),
        Commands::Restore => command_restore(&config),
        Commands::Status => command_status(&config),
        Commands::Serve => command_serve(&config),
    }
}

// ============================================================================
// SECTION: Schema Commands
// ============================================================================

/// Executes `migrate`.
fn command_migrate(config: &WorkshopConfig, command: &MigrateCommand) -> CliResult<ExitCode> {
    let (sessions, engine) = open_schema(config)?;
    let outcome = sessions.upgrade(&engine, command.target.as_deref());
    sessions.dispose();
    let report = outcome.map_err(|err| CliError::new(format!("migration failed: {err}")))?;
    if report.applied.is_empty() {
        write_stdout_line("schema already current")?;
    }
    for revision in &report.applied {
        write_stdout_line(&format!("applied {revision}"))?;
    }
    for revision in &report.skipped {
        write_stdout_line(&format!("skipped {revision} (applied concurrently)"))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `current`.
fn command_current(config: &WorkshopConfig) -> CliResult<ExitCode> {
    let (sessions, engine) = open_schema(config)?;
    let outcome = sessions.with_migration_target(|target| engine.detect_state(target));
    sessions.dispose();
    let state = outcome.map_err(|err| CliError::new(format!("failed to read revision: {err}")))?;
    let line = match state {
        DatabaseState::Fresh => "fresh (no schema)".to_string(),
        DatabaseState::Legacy {
            tables,
        } => format!("legacy (unversioned; found {})", tables.join(", ")),
        DatabaseState::Versioned {
            heads,
        } => {
            let marker = if heads.len() == 1 && heads[0] == engine.head() { " (head)" } else { "" };
            format!("{}{marker}", heads.join(", "))
        }
    };
    write_stdout_line(&line)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `history`.
fn command_history() -> CliResult<ExitCode> {
    let engine = workshop_engine().map_err(|err| CliError::new(err.to_string()))?;
    for revision in engine.revisions() {
        let parents =
            if revision.parents.is_empty() { "<base>".to_string() } else { revision.parents.join(", ") };
        let marker = if revision.id == engine.head() { " (head)" } else { "" };
        write_stdout_line(&format!(
            "{parents} -> {}{marker}  {}",
            revision.id, revision.description
        ))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `downgrade`.
fn command_downgrade(config: &WorkshopConfig, command: &DowngradeCommand) -> CliResult<ExitCode> {
    let (sessions, engine) = open_schema(config)?;
    let target = (command.target != BASE_REVISION).then_some(command.target.as_str());
    let outcome = sessions.with_migration_target(|migration| engine.downgrade(migration, target));
    sessions.dispose();
    let removed = outcome.map_err(|err| CliError::new(format!("downgrade failed: {err}")))?;
    if removed.is_empty() {
        write_stdout_line("nothing to downgrade")?;
    }
    for revision in &removed {
        write_stdout_line(&format!("removed {revision}"))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `stamp`.
fn command_stamp(config: &WorkshopConfig, command: &StampCommand) -> CliResult<ExitCode> {
    let (sessions, engine) = open_schema(config)?;
    let outcome = sessions.with_migration_target(|target| engine.stamp(target, &command.revision));
    sessions.dispose();
    outcome.map_err(|err| CliError::new(format!("stamp failed: {err}")))?;
    write_stdout_line(&format!("stamped {}", command.revision))?;
    Ok(ExitCode::SUCCESS)
}

/// Opens the pool and the schema history.
fn open_schema(config: &WorkshopConfig) -> CliResult<(DatabaseSessions, MigrationEngine)> {
    let engine = workshop_engine().map_err(|err| CliError::new(err.to_string()))?;
    let sessions = DatabaseSessions::open(&config.database)
        .map_err(|err| CliError::new(format!("failed to open database: {err}")))?;
    Ok((sessions, engine))
}

// ============================================================================
// SECTION: Snapshot Commands
// ============================================================================

/// Executes `snapshot`.
fn command_snapshot(config: &WorkshopConfig) -> CliResult<ExitCode> {
    let manager = configured_rescue(config)?;
    manager.mark_ready();
    if manager.snapshot(true) {
        write_stdout_line("snapshot uploaded")?;
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(emit_error("snapshot failed; see log for details"))
    }
}

/// Executes `restore`.
fn command_restore(config: &WorkshopConfig) -> CliResult<ExitCode> {
    let manager = configured_rescue(config)?;
    let message = if manager.restore() { "database restored" } else { "nothing restored" };
    write_stdout_line(message)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `status`.
fn command_status(config: &WorkshopConfig) -> CliResult<ExitCode> {
    let backend = config.database.target().map_err(|err| CliError::new(err.to_string()))?.kind();
    let manager = rescue_manager(config)?;
    let report = StatusReport {
        backend: backend.as_str(),
        rescue: manager.status(),
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|err| CliError::new(format!("failed to render status: {err}")))?;
    write_stdout_line(&json)?;
    Ok(ExitCode::SUCCESS)
}

/// Builds the snapshot manager from configuration.
fn rescue_manager(config: &WorkshopConfig) -> CliResult<Arc<RescueManager>> {
    let settings = config.rescue_settings().map_err(|err| CliError::new(err.to_string()))?;
    let client = config.rescue.volume_client().map_err(|err| CliError::new(err.to_string()))?;
    Ok(Arc::new(RescueManager::new(settings, client)))
}

/// Builds the snapshot manager and requires it to be configured.
fn configured_rescue(config: &WorkshopConfig) -> CliResult<Arc<RescueManager>> {
    let manager = rescue_manager(config)?;
    if !manager.is_configured() {
        return Err(CliError::new(
            "volume snapshots are not configured (set WORKSHOP_DB_BACKUP_PATH or \
             WORKSHOP_DB_BACKUP_VOLUME and a volume client)"
                .to_string(),
        ));
    }
    Ok(manager)
}

// ============================================================================
// SECTION: Serve Command
// ============================================================================

/// Executes `serve`.
fn command_serve(config: &WorkshopConfig) -> CliResult<ExitCode> {
    let started = WorkshopRuntime::on_startup(config)
        .map_err(|err| CliError::new(format!("startup failed: {err}")))?;
    let runtime = install_runtime(started).map_err(|err| CliError::new(err.to_string()))?;

    let (notify, notified) = oneshot::channel();
    let hooked = match install_signal_handlers(runtime.rescue(), move |signal| {
        runtime.on_shutdown();
        let _ = notify.send(signal);
    }) {
        Ok(hooked) => hooked,
        Err(err) => {
            warn!(error = %err, "snapshot signal hooks not installed");
            false
        }
    };
    info!(backend = runtime.sessions().kind().as_str(), "workshop database ready");

    let waiter = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(format!("failed to start signal runtime: {err}")))?;
    let signal = waiter.block_on(async move {
        if hooked { notified.await.ok() } else { shutdown_signal().await }
    });
    drop(waiter);
    // With hooks installed the listener thread already shut the runtime down.
    if !hooked || signal.is_none() {
        runtime.on_shutdown();
    }
    if let Some(signal) = signal {
        info!(signal = signal.as_str(), "shutting down");
        signal.raise_default();
    }
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() -> Option<TerminationSignal> {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok().map(|()| TerminationSignal::Interrupt)
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await.map(|()| TerminationSignal::Terminate),
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<TerminationSignal>>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// Writes one line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
        .map_err(|err| CliError::new(format!("failed to write stdout: {err}")))
}

/// Writes one line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::use_debug,
        reason = "Test-only assertions and helpers are permitted."
    )]

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn downgrade_requires_target() {
        assert!(Cli::try_parse_from(["workshop-db", "downgrade"]).is_err());
        let cli = Cli::try_parse_from(["workshop-db", "downgrade", "--target", "base"]).unwrap();
        assert!(matches!(cli.command, Commands::Downgrade(DowngradeCommand { ref target }) if target == "base"));
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["workshop-db", "migrate", "--config", "/etc/workshop.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/workshop.toml")));
        assert!(matches!(cli.command, Commands::Migrate(MigrateCommand { target: None })));
    }
}
