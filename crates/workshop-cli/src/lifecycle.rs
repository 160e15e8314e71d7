// crates/workshop-cli/src/lifecycle.rs
// ============================================================================
// Module: Workshop Lifecycle
// Description: Startup and shutdown hooks plus the process-wide runtime.
// Purpose: Restore before migrate, migrate before serve, snapshot on stop.
// Dependencies: thiserror, tracing, workshop-config, workshop-rescue,
//               workshop-store
// ============================================================================

//! ## Overview
//! Startup order matters: the snapshot must land on disk before any
//! connection opens the file, and the schema must be current before the
//! first request. A failed restore only means a fresh database; a failed
//! migration aborts startup.
//!
//! The selected backend is carried as [`DatabaseSessions`], an enum over the
//! two concrete session managers, so callers never name the backend type.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::error;
use tracing::info;
use tracing::warn;
use workshop_config::ConfigError;
use workshop_config::DatabaseConfig;
use workshop_config::WorkshopConfig;
use workshop_rescue::RescueManager;
use workshop_rescue::RescueStatus;
use workshop_rescue::VolumeClient;
use workshop_store::AnnotationUpsert;
use workshop_store::BackendKind;
use workshop_store::CredentialSource;
use workshop_store::DatabaseTarget;
use workshop_store::MigrationEngine;
use workshop_store::MigrationError;
use workshop_store::MigrationTarget;
use workshop_store::PostgresBackend;
use workshop_store::PostgresOptions;
use workshop_store::Session;
use workshop_store::SessionError;
use workshop_store::SessionManager;
use workshop_store::SqliteBackend;
use workshop_store::StaticCredentials;
use workshop_store::TokenFileCredentials;
use workshop_store::TransactionMode;
use workshop_store::UpgradeReport;
use workshop_store::Upsert;
use workshop_store::WriteCoordinator;
use workshop_store::WriteError;
use workshop_store::WriteRetryPolicy;
use workshop_store::workshop_engine;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Startup and runtime access errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Configuration could not be turned into a backend or client.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The pool could not be built or a session could not be acquired.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The schema upgrade failed; the service must not start.
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// A runtime was already installed for this process.
    #[error("workshop runtime already started")]
    AlreadyStarted,
    /// No runtime has been installed yet.
    #[error("workshop runtime not started")]
    NotStarted,
}

// ============================================================================
// SECTION: Sessions
// ============================================================================

/// Session managers for the configured backend.
pub enum DatabaseSessions {
    /// Local `SQLite` file.
    Embedded(Arc<SessionManager<SqliteBackend>>),
    /// Postgres server.
    Server(Arc<SessionManager<PostgresBackend>>),
}

impl DatabaseSessions {
    /// Builds the pool for the configured database.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the URL, credentials, or pool settings
    /// are rejected.
    pub fn open(config: &DatabaseConfig) -> Result<Self, LifecycleError> {
        match config.target()? {
            DatabaseTarget::EmbeddedFile {
                path,
            } => {
                let backend = SqliteBackend::new(path, config.sqlite)?;
                let manager = SessionManager::new(backend, config.pool, config.session_retry)?;
                Ok(Self::Embedded(Arc::new(manager)))
            }
            DatabaseTarget::RelationalServer {
                url,
            } => {
                let credentials: Arc<dyn CredentialSource> = match &config.token_file {
                    Some(path) => Arc::new(TokenFileCredentials::new(path.clone())),
                    None => Arc::new(StaticCredentials::new(None)),
                };
                let backend = PostgresBackend::new(&url, PostgresOptions::default(), credentials)?;
                let manager = SessionManager::new(backend, config.pool, config.session_retry)?;
                Ok(Self::Server(Arc::new(manager)))
            }
        }
    }

    /// Returns the backend kind.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Embedded(manager) => manager.kind(),
            Self::Server(manager) => manager.kind(),
        }
    }

    /// Returns how many times the pool has been rebuilt.
    #[must_use]
    pub fn pool_generation(&self) -> u64 {
        match self {
            Self::Embedded(manager) => manager.pool_generation(),
            Self::Server(manager) => manager.pool_generation(),
        }
    }

    /// Acquires a session with the manager's retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] once acquisition retries are exhausted.
    pub fn acquire_session(&self) -> Result<WorkshopSession<'_>, SessionError> {
        match self {
            Self::Embedded(manager) => manager.acquire_session().map(WorkshopSession::Embedded),
            Self::Server(manager) => manager.acquire_session().map(WorkshopSession::Server),
        }
    }

    /// Runs `operation` against the migration view of one session.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] from acquisition or the operation.
    pub fn with_migration_target<T, F>(&self, operation: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&mut dyn MigrationTarget) -> Result<T, MigrationError>,
    {
        let mut session = self.acquire_session()?;
        let mut target = session.migration_target();
        operation(target.as_mut())
    }

    /// Upgrades the schema to `target` (default: head).
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when any revision fails.
    pub fn upgrade(
        &self,
        engine: &MigrationEngine,
        target: Option<&str>,
    ) -> Result<UpgradeReport, MigrationError> {
        self.with_migration_target(|migration| engine.upgrade(migration, target))
    }

    /// Writes an annotation through the contention-retrying coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] when the write fails or contention outlasts
    /// `policy`.
    pub fn upsert_annotation(
        &self,
        annotation: &AnnotationUpsert,
        policy: WriteRetryPolicy,
    ) -> Result<String, WriteError> {
        match self {
            Self::Embedded(manager) => {
                WriteCoordinator::new(Arc::clone(manager), policy).upsert_annotation(annotation)
            }
            Self::Server(manager) => {
                WriteCoordinator::new(Arc::clone(manager), policy).upsert_annotation(annotation)
            }
        }
    }

    /// Closes every pooled connection.
    pub fn dispose(&self) {
        match self {
            Self::Embedded(manager) => manager.dispose(),
            Self::Server(manager) => manager.dispose(),
        }
    }
}

/// A checked-out session on either backend.
pub enum WorkshopSession<'m> {
    /// `SQLite` session.
    Embedded(Session<'m, SqliteBackend>),
    /// Postgres session.
    Server(Session<'m, PostgresBackend>),
}

impl WorkshopSession<'_> {
    /// Returns the backend kind.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Embedded(session) => session.kind(),
            Self::Server(session) => session.kind(),
        }
    }

    /// Returns whether a transaction is open.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        match self {
            Self::Embedded(session) => session.in_transaction(),
            Self::Server(session) => session.in_transaction(),
        }
    }

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the engine rejects `BEGIN`.
    pub fn begin(&mut self, mode: TransactionMode) -> Result<(), SessionError> {
        match self {
            Self::Embedded(session) => session.begin(mode),
            Self::Server(session) => session.begin(mode),
        }
    }

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the commit fails.
    pub fn commit(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Embedded(session) => session.commit(),
            Self::Server(session) => session.commit(),
        }
    }

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the rollback fails.
    pub fn rollback(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Embedded(session) => session.rollback(),
            Self::Server(session) => session.rollback(),
        }
    }

    /// Runs an upsert and returns the surviving row id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the statement fails.
    pub fn upsert(&mut self, upsert: &Upsert) -> Result<String, SessionError> {
        match self {
            Self::Embedded(session) => session.upsert(upsert),
            Self::Server(session) => session.upsert(upsert),
        }
    }

    /// Returns the schema view used by the migration engine.
    pub fn migration_target(&mut self) -> Box<dyn MigrationTarget + '_> {
        match self {
            Self::Embedded(session) => session.migration_target(),
            Self::Server(session) => session.migration_target(),
        }
    }
}

// ============================================================================
// SECTION: Runtime
// ============================================================================

/// Everything a running service needs from the database layer.
pub struct WorkshopRuntime {
    /// Pooled sessions.
    sessions: DatabaseSessions,
    /// Snapshot manager; unconfigured when no remote path is set.
    rescue: Arc<RescueManager>,
    /// Schema history.
    engine: MigrationEngine,
    /// Retry policy for contended writes.
    write_policy: WriteRetryPolicy,
}

impl WorkshopRuntime {
    /// Runs the startup sequence with the configured volume client.
    ///
    /// # Errors
    ///
    /// See [`WorkshopRuntime::on_startup_with`].
    pub fn on_startup(config: &WorkshopConfig) -> Result<Self, LifecycleError> {
        let client = config.rescue.volume_client()?;
        Self::on_startup_with(config, client)
    }

    /// Runs the startup sequence: restore, open the pool, upgrade the schema,
    /// start the snapshot timer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the pool cannot be built or the schema
    /// upgrade fails. Restore and timer failures are logged only.
    pub fn on_startup_with(
        config: &WorkshopConfig,
        client: Option<Arc<dyn VolumeClient>>,
    ) -> Result<Self, LifecycleError> {
        let rescue = Arc::new(RescueManager::new(config.rescue_settings()?, client));
        if rescue.is_configured() {
            if let Err(err) = rescue.remote_path() {
                error!(error = %err, "snapshot path rejected; snapshots disabled for this run");
            }
            rescue.restore();
        } else {
            info!("volume snapshots not configured");
        }

        let sessions = DatabaseSessions::open(&config.database)?;
        let engine = workshop_engine()?;
        match sessions.upgrade(&engine, None) {
            Ok(report) => info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                head = engine.head(),
                "database schema is current"
            ),
            Err(err) => {
                error!(error = %err, "schema upgrade failed; aborting startup");
                sessions.dispose();
                return Err(err.into());
            }
        }

        rescue.mark_ready();
        match rescue.start_periodic() {
            Ok(true) => info!(
                interval_secs = rescue.settings().snapshot_interval.as_secs(),
                "periodic snapshots started"
            ),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "periodic snapshots not started"),
        }

        Ok(Self {
            sessions,
            rescue,
            engine,
            write_policy: config.database.write_retry,
        })
    }

    /// Stops the timer, takes the final snapshot, and closes the pool.
    ///
    /// Returns true when the final snapshot uploaded. Safe to call after a
    /// signal hook already shut the rescue manager down.
    pub fn on_shutdown(&self) -> bool {
        self.rescue.stop_timer();
        let uploaded = self.rescue.shutdown();
        self.sessions.dispose();
        info!(final_snapshot = uploaded, "database layer shut down");
        uploaded
    }

    /// Returns the session managers.
    #[must_use]
    pub const fn sessions(&self) -> &DatabaseSessions {
        &self.sessions
    }

    /// Returns the snapshot manager.
    #[must_use]
    pub const fn rescue(&self) -> &Arc<RescueManager> {
        &self.rescue
    }

    /// Returns the schema history.
    #[must_use]
    pub const fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    /// Writes an annotation with the configured retry policy.
    ///
    /// # Errors
    ///
    /// See [`DatabaseSessions::upsert_annotation`].
    pub fn upsert_annotation(&self, annotation: &AnnotationUpsert) -> Result<String, WriteError> {
        self.sessions.upsert_annotation(annotation, self.write_policy)
    }
}

// ============================================================================
// SECTION: Process-Wide Runtime
// ============================================================================

/// The installed runtime.
static RUNTIME: OnceLock<WorkshopRuntime> = OnceLock::new();

/// Installs the process-wide runtime.
///
/// # Errors
///
/// Returns [`LifecycleError::AlreadyStarted`] when one is already installed;
/// the rejected runtime is shut down.
pub fn install_runtime(runtime: WorkshopRuntime) -> Result<&'static WorkshopRuntime, LifecycleError> {
    if let Err(rejected) = RUNTIME.set(runtime) {
        rejected.sessions.dispose();
        return Err(LifecycleError::AlreadyStarted);
    }
    RUNTIME.get().ok_or(LifecycleError::NotStarted)
}

/// Returns the process-wide runtime, if installed.
#[must_use]
pub fn runtime() -> Option<&'static WorkshopRuntime> {
    RUNTIME.get()
}

/// Acquires a session from the process-wide runtime.
///
/// # Errors
///
/// Returns [`LifecycleError::NotStarted`] before installation and
/// [`LifecycleError::Session`] when acquisition fails.
pub fn acquire_session() -> Result<WorkshopSession<'static>, LifecycleError> {
    let runtime = runtime().ok_or(LifecycleError::NotStarted)?;
    Ok(runtime.sessions.acquire_session()?)
}

/// Returns the snapshot status of the process-wide runtime, for health
/// checks.
#[must_use]
pub fn get_rescue_status() -> Option<RescueStatus> {
    runtime().map(|runtime| runtime.rescue.status())
}
