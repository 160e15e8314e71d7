// crates/workshop-store/tests/session_retry.rs
// ============================================================================
// Module: Session Manager Tests
// Description: Acquisition retries, pool resets, and transaction scoping.
// Purpose: Prove connection faults are retried with pool resets while other
//          faults surface immediately.
// Dependencies: workshop-store, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Wraps the SQLite backend in a backend whose health check fails on demand,
//! then counts pool generations and credential refreshes.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use common::sqlite_manager;
use tempfile::TempDir;
use workshop_store::BackendConnection;
use workshop_store::BackendKind;
use workshop_store::MigrationTarget;
use workshop_store::PoolSettings;
use workshop_store::SessionError;
use workshop_store::SessionManager;
use workshop_store::SessionRetryPolicy;
use workshop_store::SqliteBackend;
use workshop_store::SqliteOptions;
use workshop_store::StoreBackend;
use workshop_store::TransactionMode;
use workshop_store::Upsert;
use workshop_store::sqlite::SqliteConnectionManager;

// ============================================================================
// SECTION: Flaky Backend
// ============================================================================

/// SQLite backend whose ping fails a configurable number of times.
struct FlakyBackend {
    /// Real backend.
    inner: SqliteBackend,
    /// Remaining ping failures.
    failures_left: AtomicU32,
    /// Error returned by failing pings.
    error: Mutex<SessionError>,
    /// Credential refresh count.
    refreshes: AtomicU32,
}

impl FlakyBackend {
    fn new(inner: SqliteBackend, failures: u32, error: SessionError) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            error: Mutex::new(error),
            refreshes: AtomicU32::new(0),
        }
    }
}

impl StoreBackend for FlakyBackend {
    type Manager = SqliteConnectionManager;

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn connection_manager(&self) -> Result<SqliteConnectionManager, SessionError> {
        self.inner.connection_manager()
    }

    fn refresh_credentials(&self) -> Result<(), SessionError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ping(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(self.error.lock().unwrap().clone());
        }
        self.inner.ping(connection)
    }

    fn begin(
        &self,
        connection: &mut BackendConnection<Self>,
        mode: TransactionMode,
    ) -> Result<(), SessionError> {
        self.inner.begin(connection, mode)
    }

    fn commit(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        self.inner.commit(connection)
    }

    fn rollback(&self, connection: &mut BackendConnection<Self>) -> Result<(), SessionError> {
        self.inner.rollback(connection)
    }

    fn migration_target<'c>(
        &self,
        connection: &'c mut BackendConnection<Self>,
    ) -> Box<dyn MigrationTarget + 'c> {
        self.inner.migration_target(connection)
    }

    fn upsert(
        &self,
        connection: &mut BackendConnection<Self>,
        upsert: &Upsert,
    ) -> Result<String, SessionError> {
        self.inner.upsert(connection, upsert)
    }
}

/// Builds a manager over a flaky backend with three attempts.
fn flaky_manager(dir: &TempDir, failures: u32, error: SessionError) -> SessionManager<FlakyBackend> {
    let inner = SqliteBackend::new(dir.path().join("retry.db"), SqliteOptions::default()).unwrap();
    SessionManager::new(
        FlakyBackend::new(inner, failures, error),
        PoolSettings::default(),
        SessionRetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        },
    )
    .unwrap()
}

/// Counts rows in the scratch table.
fn count_rows(manager: &SessionManager<SqliteBackend>) -> i64 {
    manager
        .with_session(|session| {
            session
                .connection()
                .query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))
                .map_err(|err| SessionError::from_sqlite(&err))
        })
        .unwrap()
}

// ============================================================================
// SECTION: Acquisition
// ============================================================================

#[test]
fn persistent_connection_errors_reset_pool_between_attempts() {
    let dir = TempDir::new().unwrap();
    let manager =
        flaky_manager(&dir, u32::MAX, SessionError::Connection("connection reset".to_string()));
    let error = manager.acquire_session().err().unwrap();
    assert!(matches!(error, SessionError::Connection(_)));
    assert_eq!(manager.pool_generation(), 2);
    assert_eq!(manager.backend().refreshes.load(Ordering::SeqCst), 2);
}

#[test]
fn single_connection_error_recovers_after_one_reset() {
    let dir = TempDir::new().unwrap();
    let manager = flaky_manager(&dir, 1, SessionError::Connection("invalid authorization".to_string()));
    let session = manager.acquire_session();
    assert!(session.is_ok());
    drop(session);
    assert_eq!(manager.pool_generation(), 1);
}

#[test]
fn non_connection_errors_are_not_retried() {
    let dir = TempDir::new().unwrap();
    let manager = flaky_manager(&dir, 1, SessionError::Database("syntax error".to_string()));
    let error = manager.acquire_session().err().unwrap();
    assert!(matches!(error, SessionError::Database(_)));
    assert_eq!(manager.pool_generation(), 0);
    assert_eq!(manager.backend().refreshes.load(Ordering::SeqCst), 0);
}

#[test]
fn disposed_manager_refuses_sessions() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir.path().join("disposed.db"));
    manager.dispose();
    assert!(manager.is_disposed());
    assert_eq!(manager.acquire_session().err(), Some(SessionError::Disposed));
    assert_eq!(manager.reset_pool(), Err(SessionError::Disposed));
}

// ============================================================================
// SECTION: Transaction Scope
// ============================================================================

#[test]
fn failed_operation_rolls_back_and_connection_errors_reset_pool() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir.path().join("scope.db"));
    manager
        .with_session(|session| {
            session
                .connection()
                .execute_batch("CREATE TABLE scratch (id TEXT PRIMARY KEY);")
                .map_err(|err| SessionError::from_sqlite(&err))
        })
        .unwrap();

    let result: Result<(), SessionError> = manager.with_session(|session| {
        session
            .connection()
            .execute_batch("INSERT INTO scratch (id) VALUES ('a');")
            .map_err(|err| SessionError::from_sqlite(&err))?;
        Err(SessionError::Invalid("caller rejected".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(count_rows(&manager), 0);
    assert_eq!(manager.pool_generation(), 0);

    let result: Result<(), SessionError> = manager.with_session(|_| {
        Err(SessionError::Connection("server closed the connection unexpectedly".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(manager.pool_generation(), 1);

    manager
        .with_session_mode(TransactionMode::Immediate, |session| {
            session
                .connection()
                .execute_batch("INSERT INTO scratch (id) VALUES ('b');")
                .map_err(|err| SessionError::from_sqlite(&err))
        })
        .unwrap();
    assert_eq!(count_rows(&manager), 1);
}

#[test]
fn dropped_session_rolls_back_open_transaction() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir.path().join("drop.db"));
    manager
        .with_session(|session| {
            session
                .connection()
                .execute_batch("CREATE TABLE scratch (id TEXT PRIMARY KEY);")
                .map_err(|err| SessionError::from_sqlite(&err))
        })
        .unwrap();
    {
        let mut session = manager.acquire_session().unwrap();
        session.begin(TransactionMode::Immediate).unwrap();
        session.connection().execute_batch("INSERT INTO scratch (id) VALUES ('x');").unwrap();
        assert!(session.in_transaction());
    }
    assert_eq!(count_rows(&manager), 0);
}
