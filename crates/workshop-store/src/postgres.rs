// crates/workshop-store/src/postgres.rs
// ============================================================================
// Module: Postgres Backend
// Description: Relational-server backend with refreshable credentials.
// Purpose: Run sessions, migrations, and upserts against a Postgres server
//          whose password may be a short-lived token.
// Dependencies: postgres, r2d2_postgres, tracing
// ============================================================================

//! ## Overview
//! The server backend reads its password from a [`CredentialSource`] every
//! time the session manager builds a pool. Managed deployments hand out
//! OAuth-style tokens that expire; when a connection fails with an
//! authorization error the session manager calls
//! [`StoreBackend::refresh_credentials`] and rebuilds the pool so new
//! connections carry the fresh token.
//!
//! Migrations on the server use in-place `ALTER TABLE` statements, so
//! [`SchemaOps::rebuild_table`] runs the revision's server statements rather
//! than copying rows.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use postgres::Client;
use postgres::GenericClient;
use postgres::NoTls;
use postgres::types::ToSql;
use r2d2_postgres::PostgresConnectionManager;
use tracing::debug;
use tracing::info;

use crate::backend::BackendConnection;
use crate::backend::BackendKind;
use crate::backend::StoreBackend;
use crate::backend::TransactionMode;
use crate::error::SessionError;
use crate::migrate::ColumnInfo;
use crate::migrate::HeadPlanner;
use crate::migrate::MigrationError;
use crate::migrate::MigrationTarget;
use crate::migrate::REVISION_TABLE;
use crate::migrate::SchemaOps;
use crate::migrate::StepFn;
use crate::migrate::TableRebuild;
use crate::write::PlaceholderStyle;
use crate::write::SqlValue;
use crate::write::Upsert;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default connect timeout (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default statement timeout (ms).
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// SECTION: Credentials
// ============================================================================

/// Supplies the password used for new server connections.
pub trait CredentialSource: Send + Sync {
    /// Returns the current password, or `None` to use the URL's own.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the credential cannot be read.
    fn token(&self) -> Result<Option<String>, SessionError>;

    /// Forces the next [`CredentialSource::token`] call to fetch fresh
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the refresh fails.
    fn refresh(&self) -> Result<(), SessionError>;
}

/// Fixed credentials: the URL password or a configured secret.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    /// Optional password override.
    password: Option<String>,
}

impl StaticCredentials {
    /// Creates a static credential source.
    #[must_use]
    pub const fn new(password: Option<String>) -> Self {
        Self {
            password,
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn token(&self) -> Result<Option<String>, SessionError> {
        Ok(self.password.clone())
    }

    fn refresh(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Token read from a file that an external agent rotates.
pub struct TokenFileCredentials {
    /// Token file path.
    path: PathBuf,
    /// Last token read.
    cached: Mutex<Option<String>>,
}

impl TokenFileCredentials {
    /// Creates a token-file credential source; the file is read lazily.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Reads and trims the token file.
    fn read_token(&self) -> Result<String, SessionError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|err| {
            SessionError::Connection(format!(
                "failed to read database token file {}: {err}",
                self.path.display()
            ))
        })?;
        let token = raw.trim().to_string();
        if token.is_empty() {
            return Err(SessionError::Connection(format!(
                "database token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token)
    }
}

impl fmt::Debug for TokenFileCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenFileCredentials").field("path", &self.path).finish_non_exhaustive()
    }
}

impl CredentialSource for TokenFileCredentials {
    fn token(&self) -> Result<Option<String>, SessionError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = cached.as_ref() {
            return Ok(Some(token.clone()));
        }
        let token = self.read_token()?;
        *cached = Some(token.clone());
        drop(cached);
        Ok(Some(token))
    }

    fn refresh(&self) -> Result<(), SessionError> {
        let token = self.read_token()?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        info!(path = %self.path.display(), "database token refreshed");
        Ok(())
    }
}

// ============================================================================
// SECTION: Backend
// ============================================================================

/// Server connection settings beyond the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostgresOptions {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-statement timeout in milliseconds.
    pub statement_timeout_ms: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
        }
    }
}

/// Relational-server backend.
#[derive(Clone)]
pub struct PostgresBackend {
    /// Parsed connection settings without the rotating password.
    config: postgres::Config,
    /// Timeouts.
    options: PostgresOptions,
    /// Password source.
    credentials: Arc<dyn CredentialSource>,
}

impl fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Creates the backend from a `postgres://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] when the URL does not parse.
    pub fn new(
        url: &str,
        options: PostgresOptions,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, SessionError> {
        let config = url
            .parse::<postgres::Config>()
            .map_err(|err| SessionError::Invalid(format!("invalid postgres url: {err}")))?;
        Ok(Self {
            config,
            options,
            credentials,
        })
    }
}

impl StoreBackend for PostgresBackend {
    type Manager = PostgresConnectionManager<NoTls>;

    fn kind(&self) -> BackendKind {
        BackendKind::RelationalServer
    }

    fn connection_manager(&self) -> Result<Self::Manager, SessionError> {
        let mut config = self.config.clone();
        if let Some(token) = self.credentials.token()? {
            config.password(token);
        }
        config.connect_timeout(Duration::from_millis(self.options.connect_timeout_ms));
        config.options(&format!("-c statement_timeout={}", self.options.statement_timeout_ms));
        Ok(PostgresConnectionManager::new(config, NoTls))
    }

    fn refresh_credentials(&self) -> Result<(), SessionError> {
        self.credentials.refresh()
    }

    fn ping(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        connection
            .simple_query("SELECT 1")
            .map(|_| ())
            .map_err(|err| SessionError::from_postgres(&err))
    }

    fn begin(
        &self,
        connection: &mut BackendConnection<Self>,
        _mode: TransactionMode,
    ) -> Result<(), SessionError> {
        // Row-level locking makes an up-front write lock unnecessary.
        connection.batch_execute("BEGIN").map_err(|err| SessionError::from_postgres(&err))
    }

    fn commit(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        connection.batch_execute("COMMIT").map_err(|err| SessionError::from_postgres(&err))
    }

    fn rollback(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        connection.batch_execute("ROLLBACK").map_err(|err| SessionError::from_postgres(&err))
    }

    fn migration_target<'c>(
        &self,
        connection: &'c mut BackendConnection<Self>,
    ) -> Box<dyn MigrationTarget + 'c> {
        Box::new(PostgresMigrationTarget {
            client: connection,
        })
    }

    fn upsert(
        &self,
        connection: &mut BackendConnection<Self>,
        upsert: &Upsert,
    ) -> Result<String, SessionError> {
        let sql = upsert.statement(PlaceholderStyle::DollarNumbered)?;
        let values: Vec<Box<dyn ToSql + Sync>> =
            upsert.parameters().into_iter().map(postgres_value).collect();
        let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(AsRef::as_ref).collect();
        let row = connection.query_one(sql.as_str(), &params).map_err(|err| SessionError::from_postgres(&err))?;
        row.try_get::<_, String>(0).map_err(|err| SessionError::from_postgres(&err))
    }
}

/// Converts a bound value to a typed Postgres parameter.
fn postgres_value(value: SqlValue) -> Box<dyn ToSql + Sync> {
    match value {
        SqlValue::Text(text) => Box::new(text),
        SqlValue::Integer(number) => Box::new(number),
        SqlValue::Real(number) => Box::new(number),
    }
}

// ============================================================================
// SECTION: Migration Target
// ============================================================================

/// Migration handle over one pooled client.
pub struct PostgresMigrationTarget<'c> {
    /// Borrowed client.
    client: &'c mut Client,
}

impl MigrationTarget for PostgresMigrationTarget<'_> {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::RelationalServer
    }

    fn marker_exists(&mut self) -> Result<bool, MigrationError> {
        table_exists_on(self.client, REVISION_TABLE)
    }

    fn ensure_marker(&mut self) -> Result<(), MigrationError> {
        self.client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {REVISION_TABLE} (revision_id VARCHAR(64) NOT NULL \
                 PRIMARY KEY)"
            ))
            .map_err(postgres_migration_error)
    }

    fn read_heads(&mut self) -> Result<Vec<String>, MigrationError> {
        read_heads_on(self.client)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError> {
        table_exists_on(self.client, table)
    }

    fn run_step(
        &mut self,
        step: StepFn,
        plan: &mut HeadPlanner<'_>,
    ) -> Result<bool, MigrationError> {
        let mut tx = self.client.transaction().map_err(postgres_migration_error)?;
        // Serializes concurrent migrators on the marker table.
        tx.batch_execute(&format!("LOCK TABLE {REVISION_TABLE} IN EXCLUSIVE MODE"))
            .map_err(postgres_migration_error)?;
        let heads = read_heads_on(&mut tx)?;
        let Some(next_heads) = plan(&heads)? else {
            return Ok(false);
        };
        {
            let mut ops = PostgresSchema {
                tx: &mut tx,
            };
            step(&mut ops)?;
        }
        tx.batch_execute(&format!("DELETE FROM {REVISION_TABLE}")).map_err(postgres_migration_error)?;
        let insert = format!("INSERT INTO {REVISION_TABLE} (revision_id) VALUES ($1)");
        for head in &next_heads {
            tx.execute(insert.as_str(), &[head])
                .map_err(postgres_migration_error)?;
        }
        tx.commit().map_err(postgres_migration_error)?;
        Ok(true)
    }
}

/// Maps a driver error into the migration taxonomy.
fn postgres_migration_error(error: postgres::Error) -> MigrationError {
    MigrationError::Database(error.to_string())
}

/// Returns true when the table exists in the current schema.
fn table_exists_on<C: GenericClient>(client: &mut C, table: &str) -> Result<bool, MigrationError> {
    client
        .query_opt(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND \
             table_name::text = $1",
            &[&table],
        )
        .map(|row| row.is_some())
        .map_err(postgres_migration_error)
}

/// Reads the head set, returning nothing when the marker is absent.
fn read_heads_on<C: GenericClient>(client: &mut C) -> Result<Vec<String>, MigrationError> {
    if !table_exists_on(client, REVISION_TABLE)? {
        return Ok(Vec::new());
    }
    let select = format!("SELECT revision_id FROM {REVISION_TABLE} ORDER BY revision_id");
    let rows = client
        .query(select.as_str(), &[])
        .map_err(postgres_migration_error)?;
    rows.iter().map(|row| row.try_get::<_, String>(0).map_err(postgres_migration_error)).collect()
}

// ============================================================================
// SECTION: Schema Operations
// ============================================================================

/// [`SchemaOps`] over an open Postgres transaction.
struct PostgresSchema<'a, 'c> {
    /// Open transaction.
    tx: &'a mut postgres::Transaction<'c>,
}

impl SchemaOps for PostgresSchema<'_, '_> {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::RelationalServer
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError> {
        table_exists_on(self.tx, table)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, MigrationError> {
        let primary_keys: Vec<String> = self
            .tx
            .query(
                "SELECT kcu.column_name::text FROM information_schema.table_constraints tc JOIN \
                 information_schema.key_column_usage kcu ON tc.constraint_name = \
                 kcu.constraint_name AND tc.table_schema = kcu.table_schema WHERE \
                 tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = current_schema() AND \
                 tc.table_name::text = $1",
                &[&table],
            )
            .map_err(postgres_migration_error)?
            .iter()
            .map(|row| row.try_get::<_, String>(0).map_err(postgres_migration_error))
            .collect::<Result<_, _>>()?;
        let rows = self
            .tx
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text FROM \
                 information_schema.columns WHERE table_schema = current_schema() AND \
                 table_name::text = $1 ORDER BY ordinal_position",
                &[&table],
            )
            .map_err(postgres_migration_error)?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(postgres_migration_error)?;
                let declared_type: String = row.try_get(1).map_err(postgres_migration_error)?;
                let nullable: String = row.try_get(2).map_err(postgres_migration_error)?;
                Ok(ColumnInfo {
                    primary_key: primary_keys.contains(&name),
                    name,
                    declared_type,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                })
            })
            .collect()
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, MigrationError> {
        self.tx
            .query_opt(
                "SELECT 1 FROM pg_indexes WHERE schemaname = current_schema() AND indexname::text \
                 = $1",
                &[&index],
            )
            .map(|row| row.is_some())
            .map_err(postgres_migration_error)
    }

    fn execute(&mut self, sql: &str) -> Result<(), MigrationError> {
        self.tx.batch_execute(sql).map_err(postgres_migration_error)
    }

    fn rebuild_table(&mut self, rebuild: &TableRebuild<'_>) -> Result<(), MigrationError> {
        if !self.table_exists(rebuild.table)? {
            return Err(MigrationError::Invalid(format!("table {} does not exist", rebuild.table)));
        }
        for statement in rebuild.server_statements {
            self.execute(statement)?;
        }
        debug!(
            table = rebuild.table,
            statements = rebuild.server_statements.len(),
            "altered postgres table in place"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
