// crates/workshop-store/src/sqlite.rs
// ============================================================================
// Module: SQLite Backend
// Description: Embedded-file backend: pooled connections, pragmas, schema
//              introspection, and table rebuilds.
// Purpose: Run sessions, migrations, and upserts against a local SQLite file.
// Dependencies: r2d2, rusqlite, serde, tracing
// ============================================================================

//! ## Overview
//! Every pooled connection is opened with the same pragmas: foreign keys on,
//! the configured journal and sync modes, and a busy timeout long enough to
//! ride out concurrent writers (30 s by default). WAL mode lets readers
//! proceed while a single writer holds the lock.
//!
//! `SQLite` cannot drop `NOT NULL` or columns in place, so
//! [`SchemaOps::rebuild_table`] creates a replacement table, copies the rows
//! for the columns both shapes share, swaps the tables, and recreates the
//! original indexes. Columns the new shape does not name (hand-patched
//! deployments) are carried over with their declared type, nullability, and
//! default. It runs inside the revision transaction so a failure leaves the
//! old table untouched.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use r2d2::ManageConnection;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use rusqlite::types::Value;
use serde::Deserialize;
use serde::Serialize;
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

/// Default busy timeout (ms).
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Prefix for the scratch table used during rebuilds.
const REBUILD_PREFIX: &str = "_rebuild_";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Per-connection `SQLite` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Journal mode.
    pub journal_mode: SqliteJournalMode,
    /// Sync mode.
    pub sync_mode: SqliteSyncMode,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

// ============================================================================
// SECTION: Connection Manager
// ============================================================================

/// r2d2 manager opening `SQLite` connections with the store's pragmas.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    /// Database file path.
    path: PathBuf,
    /// Connection settings.
    options: SqliteOptions,
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        open_connection(&self.path, &self.options)
    }

    fn is_valid(&self, connection: &mut Connection) -> Result<(), rusqlite::Error> {
        connection.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _connection: &mut Connection) -> bool {
        false
    }
}

/// Opens an `SQLite` connection with the store pragmas applied.
fn open_connection(path: &Path, options: &SqliteOptions) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(path, flags)?;
    apply_pragmas(&connection, options)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability and concurrency.
///
/// The busy timeout goes first so the journal-mode switch itself waits out a
/// concurrent opener instead of failing.
fn apply_pragmas(connection: &Connection, options: &SqliteOptions) -> Result<(), rusqlite::Error> {
    connection.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    connection
        .query_row(&format!("PRAGMA journal_mode = {};", options.journal_mode.pragma_value()), [], |_| {
            Ok(())
        })?;
    connection.execute_batch(&format!("PRAGMA synchronous = {};", options.sync_mode.pragma_value()))?;
    Ok(())
}

// ============================================================================
// SECTION: Backend
// ============================================================================

/// Embedded-file backend.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    /// Database file path.
    path: PathBuf,
    /// Connection settings.
    options: SqliteOptions,
}

impl SqliteBackend {
    /// Creates the backend, creating the parent directory when missing.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the path is invalid or its directory
    /// cannot be created.
    pub fn new(path: impl Into<PathBuf>, options: SqliteOptions) -> Result<Self, SessionError> {
        let path = path.into();
        validate_store_path(&path)?;
        ensure_parent_dir(&path)?;
        Ok(Self {
            path,
            options,
        })
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the connection settings.
    #[must_use]
    pub const fn options(&self) -> &SqliteOptions {
        &self.options
    }
}

impl StoreBackend for SqliteBackend {
    type Manager = SqliteConnectionManager;

    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedFile
    }

    fn connection_manager(&self) -> Result<SqliteConnectionManager, SessionError> {
        Ok(SqliteConnectionManager {
            path: self.path.clone(),
            options: self.options,
        })
    }

    fn ping(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        connection
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|err| SessionError::from_sqlite(&err))
    }

    fn begin(
        &self,
        connection: &mut BackendConnection<Self>,
        mode: TransactionMode,
    ) -> Result<(), SessionError> {
        let statement = match mode {
            TransactionMode::Deferred => "BEGIN DEFERRED",
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
        };
        connection.execute_batch(statement).map_err(|err| SessionError::from_sqlite(&err))
    }

    fn commit(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        connection.execute_batch("COMMIT").map_err(|err| SessionError::from_sqlite(&err))
    }

    fn rollback(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        if connection.is_autocommit() {
            return Ok(());
        }
        connection.execute_batch("ROLLBACK").map_err(|err| SessionError::from_sqlite(&err))
    }

    fn migration_target<'c>(
        &self,
        connection: &'c mut BackendConnection<Self>,
    ) -> Box<dyn MigrationTarget + 'c> {
        Box::new(SqliteMigrationTarget {
            connection,
        })
    }

    fn upsert(
        &self,
        connection: &mut BackendConnection<Self>,
        upsert: &Upsert,
    ) -> Result<String, SessionError> {
        let sql = upsert.statement(PlaceholderStyle::QuestionNumbered)?;
        let values: Vec<Value> = upsert.parameters().into_iter().map(sqlite_value).collect();
        connection
            .query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| row.get::<_, String>(0))
            .map_err(|err| SessionError::from_sqlite(&err))
    }
}

/// Converts a bound value to the `SQLite` representation.
fn sqlite_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Text(Some(text)) => Value::Text(text),
        SqlValue::Integer(Some(number)) => Value::Integer(number),
        SqlValue::Real(Some(number)) => Value::Real(number),
        SqlValue::Text(None) | SqlValue::Integer(None) | SqlValue::Real(None) => Value::Null,
    }
}

// ============================================================================
// SECTION: Migration Target
// ============================================================================

/// Migration handle over one pooled connection.
pub struct SqliteMigrationTarget<'c> {
    /// Borrowed connection.
    connection: &'c mut Connection,
}

impl SqliteMigrationTarget<'_> {
    /// Runs the step and head update inside one immediate transaction.
    fn run_step_in_transaction(
        &mut self,
        step: StepFn,
        plan: &mut HeadPlanner<'_>,
    ) -> Result<bool, MigrationError> {
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sqlite_migration_error)?;
        let heads = read_heads_on(&tx)?;
        let Some(next_heads) = plan(&heads)? else {
            return Ok(false);
        };
        {
            let mut ops = SqliteSchema {
                connection: &tx,
            };
            step(&mut ops)?;
        }
        ensure_foreign_keys_clean(&tx)?;
        write_heads_on(&tx, &next_heads)?;
        tx.commit().map_err(sqlite_migration_error)?;
        Ok(true)
    }
}

impl MigrationTarget for SqliteMigrationTarget<'_> {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::EmbeddedFile
    }

    fn marker_exists(&mut self) -> Result<bool, MigrationError> {
        table_exists_on(self.connection, REVISION_TABLE)
    }

    fn ensure_marker(&mut self) -> Result<(), MigrationError> {
        self.connection
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {REVISION_TABLE} (revision_id VARCHAR(64) NOT NULL \
                 PRIMARY KEY)"
            ))
            .map_err(sqlite_migration_error)
    }

    fn read_heads(&mut self) -> Result<Vec<String>, MigrationError> {
        read_heads_on(self.connection)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError> {
        table_exists_on(self.connection, table)
    }

    fn run_step(
        &mut self,
        step: StepFn,
        plan: &mut HeadPlanner<'_>,
    ) -> Result<bool, MigrationError> {
        // Foreign key enforcement cannot change inside a transaction, and a
        // rebuild drops the referenced table mid-step.
        let previous: i64 = self
            .connection
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(sqlite_migration_error)?;
        self.connection.execute_batch("PRAGMA foreign_keys = OFF;").map_err(sqlite_migration_error)?;
        let outcome = self.run_step_in_transaction(step, plan);
        let restore = self
            .connection
            .execute_batch(&format!("PRAGMA foreign_keys = {};", if previous == 0 { "OFF" } else { "ON" }))
            .map_err(sqlite_migration_error);
        let executed = outcome?;
        restore?;
        Ok(executed)
    }
}

/// Maps a driver error into the migration taxonomy.
fn sqlite_migration_error(error: rusqlite::Error) -> MigrationError {
    MigrationError::Database(error.to_string())
}

/// Returns true when the table exists.
fn table_exists_on(connection: &Connection, table: &str) -> Result<bool, MigrationError> {
    connection
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(sqlite_migration_error)
}

/// Reads the head set, returning nothing when the marker is absent.
fn read_heads_on(connection: &Connection) -> Result<Vec<String>, MigrationError> {
    if !table_exists_on(connection, REVISION_TABLE)? {
        return Ok(Vec::new());
    }
    let mut statement = connection
        .prepare(&format!("SELECT revision_id FROM {REVISION_TABLE} ORDER BY revision_id"))
        .map_err(sqlite_migration_error)?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(sqlite_migration_error)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_migration_error)
}

/// Replaces the head set.
fn write_heads_on(connection: &Connection, heads: &[String]) -> Result<(), MigrationError> {
    connection
        .execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {REVISION_TABLE} (revision_id VARCHAR(64) NOT NULL \
             PRIMARY KEY); DELETE FROM {REVISION_TABLE};"
        ))
        .map_err(sqlite_migration_error)?;
    for head in heads {
        connection
            .execute(&format!("INSERT INTO {REVISION_TABLE} (revision_id) VALUES (?1)"), params![head])
            .map_err(sqlite_migration_error)?;
    }
    Ok(())
}

/// Fails when the step left dangling foreign key references.
fn ensure_foreign_keys_clean(connection: &Connection) -> Result<(), MigrationError> {
    let violation = connection
        .query_row("PRAGMA foreign_key_check", [], |row| row.get::<_, String>(0))
        .optional()
        .map_err(sqlite_migration_error)?;
    match violation {
        Some(table) => Err(MigrationError::Database(format!(
            "foreign key violation in table {table} after migration step"
        ))),
        None => Ok(()),
    }
}

// ============================================================================
// SECTION: Schema Operations
// ============================================================================

/// [`SchemaOps`] over an open `SQLite` transaction.
struct SqliteSchema<'a> {
    /// Transaction connection.
    connection: &'a Connection,
}

impl SchemaOps for SqliteSchema<'_> {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::EmbeddedFile
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError> {
        table_exists_on(self.connection, table)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, MigrationError> {
        let mut statement = self
            .connection
            .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")
            .map_err(sqlite_migration_error)?;
        let rows = statement
            .query_map(params![table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0,
                    primary_key: row.get::<_, i64>(3)? > 0,
                })
            })
            .map_err(sqlite_migration_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_migration_error)
    }

    fn index_exists(&mut self, index: &str) -> Result<bool, MigrationError> {
        self.connection
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![index],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(sqlite_migration_error)
    }

    fn execute(&mut self, sql: &str) -> Result<(), MigrationError> {
        self.connection.execute_batch(sql).map_err(sqlite_migration_error)
    }

    fn rebuild_table(&mut self, rebuild: &TableRebuild<'_>) -> Result<(), MigrationError> {
        let table = rebuild.table;
        if !crate::backend::is_valid_identifier(table) {
            return Err(MigrationError::Invalid(format!("invalid identifier: '{table}'")));
        }
        if !self.table_exists(table)? {
            return Err(MigrationError::Invalid(format!("table {table} does not exist")));
        }
        let scratch = format!("{REBUILD_PREFIX}{table}");
        let declared = rebuild.column_names();
        let existing: Vec<String> =
            self.columns(table)?.into_iter().map(|column| column.name).collect();
        let mut copied: Vec<&str> = declared
            .iter()
            .copied()
            .filter(|name| existing.iter().any(|column| column.eq_ignore_ascii_case(name)))
            .collect();
        let extras = self.extra_columns(table, &declared)?;
        copied.extend(extras.iter().map(|extra| extra.name.as_str()));
        let index_sql = {
            let mut statement = self
                .connection
                .prepare(
                    "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql \
                     IS NOT NULL",
                )
                .map_err(sqlite_migration_error)?;
            let rows = statement
                .query_map(params![table], |row| row.get::<_, String>(0))
                .map_err(sqlite_migration_error)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_migration_error)?
        };

        self.execute(&format!("DROP TABLE IF EXISTS {scratch}"))?;
        let body = rebuild
            .columns
            .iter()
            .map(|definition| (*definition).to_string())
            .chain(extras.iter().map(ExtraColumn::definition))
            .chain(rebuild.constraints.iter().map(|constraint| (*constraint).to_string()))
            .collect::<Vec<_>>()
            .join(",\n    ");
        self.execute(&format!("CREATE TABLE {scratch} (\n    {body}\n)"))?;
        if !copied.is_empty() {
            let columns = copied.join(", ");
            self.execute(&format!("INSERT INTO {scratch} ({columns}) SELECT {columns} FROM {table}"))?;
        }
        self.execute(&format!("DROP TABLE {table}"))?;
        self.execute(&format!("ALTER TABLE {scratch} RENAME TO {table}"))?;
        for sql in &index_sql {
            self.execute(sql)?;
        }
        if !extras.is_empty() {
            info!(table, preserved = extras.len(), "kept columns outside the rebuilt shape");
        }
        debug!(table, copied = copied.len(), indexes = index_sql.len(), "rebuilt sqlite table");
        Ok(())
    }
}

impl SqliteSchema<'_> {
    /// Returns existing columns the rebuilt shape does not declare.
    fn extra_columns(
        &self,
        table: &str,
        declared: &[&str],
    ) -> Result<Vec<ExtraColumn>, MigrationError> {
        let mut statement = self
            .connection
            .prepare("SELECT name, type, \"notnull\", dflt_value FROM pragma_table_info(?1)")
            .map_err(sqlite_migration_error)?;
        let rows = statement
            .query_map(params![table], |row| {
                Ok(ExtraColumn {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    default: row.get(3)?,
                })
            })
            .map_err(sqlite_migration_error)?;
        let mut extras = Vec::new();
        for column in rows {
            let column = column.map_err(sqlite_migration_error)?;
            if declared.iter().any(|name| name.eq_ignore_ascii_case(&column.name)) {
                continue;
            }
            if !crate::backend::is_valid_identifier(&column.name) {
                return Err(MigrationError::Invalid(format!(
                    "cannot carry column '{}' of {table} through a rebuild",
                    column.name
                )));
            }
            extras.push(column);
        }
        Ok(extras)
    }
}

/// Column kept through a rebuild because the new shape does not name it.
struct ExtraColumn {
    /// Column name.
    name: String,
    /// Declared type; may be empty.
    declared_type: String,
    /// True when declared `NOT NULL`.
    not_null: bool,
    /// Default expression as stored in the catalog.
    default: Option<String>,
}

impl ExtraColumn {
    /// Renders the column definition for `CREATE TABLE`.
    fn definition(&self) -> String {
        let mut definition = self.name.clone();
        if !self.declared_type.is_empty() {
            definition.push(' ');
            definition.push_str(&self.declared_type);
        }
        if self.not_null {
            definition.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            definition.push_str(" DEFAULT ");
            definition.push_str(default);
        }
        definition
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the database exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SessionError> {
    let Some(parent) = path.parent() else {
        return Err(SessionError::Invalid("database path missing parent directory".to_string()));
    };
    std::fs::create_dir_all(parent).map_err(|err| SessionError::Connection(err.to_string()))
}

/// Validates database paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SessionError> {
    if path.as_os_str().is_empty() {
        return Err(SessionError::Invalid("database path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SessionError::Invalid("database path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SessionError::Invalid(
                "database path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SessionError::Invalid(
            "database path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic, reason = "Test-only assertions.")]

    use r2d2::ManageConnection;
    use tempfile::TempDir;

    use super::SqliteBackend;
    use super::SqliteJournalMode;
    use super::SqliteOptions;
    use crate::backend::StoreBackend;

    #[test]
    fn connections_apply_wal_and_busy_timeout() {
        let dir = TempDir::new().unwrap();
        let backend =
            SqliteBackend::new(dir.path().join("nested").join("workshop.db"), SqliteOptions::default())
                .unwrap();
        let manager = backend.connection_manager().unwrap();
        let connection = manager.connect().unwrap();
        let mode: String = connection.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode, SqliteJournalMode::Wal.pragma_value());
        let timeout: i64 = connection.query_row("PRAGMA busy_timeout", [], |row| row.get(0)).unwrap();
        assert_eq!(timeout, 30_000);
        let foreign_keys: i64 =
            connection.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn directory_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(SqliteBackend::new(dir.path(), SqliteOptions::default()).is_err());
        assert!(SqliteBackend::new("", SqliteOptions::default()).is_err());
    }
}
