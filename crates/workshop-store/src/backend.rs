// crates/workshop-store/src/backend.rs
// ============================================================================
// Module: Backend Selection
// Description: Database URL parsing and the per-backend capability trait.
// Purpose: Let sessions, migrations, and writes run unchanged against an
//          embedded SQLite file or a Postgres server.
// Dependencies: r2d2, serde
// ============================================================================

//! ## Overview
//! A [`DatabaseTarget`] is parsed from the configured connection string and
//! picks one of two [`StoreBackend`] implementations:
//! [`crate::SqliteBackend`] for `sqlite://` URLs and
//! [`crate::PostgresBackend`] for `postgres://` URLs. The trait is the seam
//! where the backends differ: transaction control, schema introspection for
//! migrations, and placeholder syntax for upserts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;

use r2d2::ManageConnection;
use serde::Serialize;

use crate::error::SessionError;
use crate::migrate::MigrationTarget;
use crate::write::Upsert;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// URL prefix selecting the embedded-file backend.
const SQLITE_PREFIX: &str = "sqlite:///";
/// URL prefixes selecting the relational-server backend.
const POSTGRES_PREFIXES: [&str; 2] = ["postgres://", "postgresql://"];
/// Maximum identifier length accepted in generated SQL (Postgres limit).
const MAX_IDENTIFIER_LENGTH: usize = 63;

// ============================================================================
// SECTION: Backend Kind
// ============================================================================

/// Which family of database engine is behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-file embedded database (`SQLite`).
    EmbeddedFile,
    /// Network relational server (Postgres).
    RelationalServer,
}

impl BackendKind {
    /// Returns a stable label for logs and status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmbeddedFile => "embedded_file",
            Self::RelationalServer => "relational_server",
        }
    }
}

/// Transaction start mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Defer lock acquisition until the first statement needs it.
    #[default]
    Deferred,
    /// Take the write lock up front (`BEGIN IMMEDIATE` on `SQLite`).
    Immediate,
}

// ============================================================================
// SECTION: Database Target
// ============================================================================

/// Parsed database connection string.
///
/// # Invariants
/// - `EmbeddedFile.path` is non-empty.
/// - `RelationalServer.url` keeps the caller's original string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    /// Local `SQLite` file.
    EmbeddedFile {
        /// Database file path.
        path: PathBuf,
    },
    /// Postgres server.
    RelationalServer {
        /// Connection URL.
        url: String,
    },
}

impl DatabaseTarget {
    /// Parses a connection string.
    ///
    /// `sqlite:///workshop.db` is relative to the working directory and
    /// `sqlite:////var/data/workshop.db` is absolute.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] for unknown schemes or empty paths.
    pub fn parse(url: &str) -> Result<Self, SessionError> {
        let trimmed = url.trim();
        if let Some(rest) = trimmed.strip_prefix(SQLITE_PREFIX) {
            let path = rest.split('?').next().unwrap_or_default();
            if path.is_empty() {
                return Err(SessionError::Invalid("sqlite url is missing a file path".to_string()));
            }
            if path == ":memory:" {
                return Err(SessionError::Invalid(
                    "in-memory sqlite databases cannot be shared or snapshotted".to_string(),
                ));
            }
            return Ok(Self::EmbeddedFile {
                path: PathBuf::from(path),
            });
        }
        if POSTGRES_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
            return Ok(Self::RelationalServer {
                url: trimmed.to_string(),
            });
        }
        Err(SessionError::Invalid(
            "database url must start with sqlite:/// or postgres://".to_string(),
        ))
    }

    /// Returns the backend kind selected by this target.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::EmbeddedFile {
                ..
            } => BackendKind::EmbeddedFile,
            Self::RelationalServer {
                ..
            } => BackendKind::RelationalServer,
        }
    }

    /// Returns the local file path for the embedded backend.
    #[must_use]
    pub const fn local_path(&self) -> Option<&PathBuf> {
        match self {
            Self::EmbeddedFile {
                path,
            } => Some(path),
            Self::RelationalServer {
                ..
            } => None,
        }
    }
}

// ============================================================================
// SECTION: Identifiers
// ============================================================================

/// Returns true when `name` is safe to interpolate as a SQL identifier.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LENGTH
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

// ============================================================================
// SECTION: Backend Trait
// ============================================================================

/// Connection type produced by a backend's pool manager.
pub type BackendConnection<B> = <<B as StoreBackend>::Manager as ManageConnection>::Connection;

/// Capabilities a database backend provides to the store.
///
/// Implementations are cheap to share; the session manager calls
/// [`StoreBackend::connection_manager`] every time it rebuilds its pool.
pub trait StoreBackend: Send + Sync + Sized + 'static {
    /// Pool connection manager type.
    type Manager: ManageConnection;

    /// Returns the backend family.
    fn kind(&self) -> BackendKind;

    /// Builds a fresh connection manager for a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the manager cannot be configured.
    fn connection_manager(&self) -> Result<Self::Manager, SessionError>;

    /// Refreshes held credentials before the pool is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the refresh fails.
    fn refresh_credentials(&self) -> Result<(), SessionError> {
        Ok(())
    }

    /// Runs a trivial round-trip to prove the connection is alive.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the connection is unusable.
    fn ping(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError>;

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the transaction cannot start.
    fn begin(
        &self,
        connection: &mut BackendConnection<Self>,
        mode: TransactionMode,
    ) -> Result<(), SessionError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the commit fails.
    fn commit(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the rollback fails.
    fn rollback(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError>;

    /// Wraps a connection for the migration engine.
    fn migration_target<'c>(
        &self,
        connection: &'c mut BackendConnection<Self>,
    ) -> Box<dyn MigrationTarget + 'c>;

    /// Executes an upsert and returns the row identifier that survived.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the statement fails.
    fn upsert(
        &self,
        connection: &mut BackendConnection<Self>,
        upsert: &Upsert,
    ) -> Result<String, SessionError>;
}

// ============================================================================
// SECTION: Tests
// ============================================================================
