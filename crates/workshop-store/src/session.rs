// crates/workshop-store/src/session.rs
// ============================================================================
// Module: Session Manager
// Description: Pooled sessions with health checks, pool reset, and
//              transaction scoping.
// Purpose: Hand out database sessions that survive dropped connections and
//          rotated credentials without leaking state between callers.
// Dependencies: r2d2, serde, tracing
// ============================================================================

//! ## Overview
//! [`SessionManager`] owns an r2d2 pool over one [`StoreBackend`]. Every
//! checkout runs the backend's ping. Connection-class failures during
//! acquisition trigger a pool reset (credentials refreshed, pool rebuilt,
//! generation bumped) and a bounded retry with linear backoff; other errors
//! surface immediately.
//!
//! [`SessionManager::with_session`] scopes a transaction: commit on success,
//! rollback on any error, and a pool reset when the error says the
//! connection itself is gone. A [`Session`] dropped with an open transaction
//! rolls it back so the connection returns to the pool clean.
//!
//! Pool sizing follows the familiar `pool_size` plus `max_overflow` model:
//! up to `pool_size` idle connections are kept warm and bursts may open
//! `max_overflow` more.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use r2d2::Pool;
use r2d2::PooledConnection;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::BackendConnection;
use crate::backend::BackendKind;
use crate::backend::StoreBackend;
use crate::backend::TransactionMode;
use crate::error::SessionError;
use crate::migrate::MigrationEngine;
use crate::migrate::MigrationError;
use crate::migrate::MigrationTarget;
use crate::migrate::UpgradeReport;
use crate::write::Upsert;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default persistent pool size.
pub const DEFAULT_POOL_SIZE: u32 = 5;
/// Default burst connections above the pool size.
pub const DEFAULT_MAX_OVERFLOW: u32 = 10;
/// Default checkout timeout (ms).
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 30_000;
/// Default connection recycle age (seconds).
pub const DEFAULT_POOL_RECYCLE_SECS: u64 = 3_600;
/// Default acquisition attempts.
pub const DEFAULT_SESSION_ATTEMPTS: u32 = 3;
/// Default acquisition backoff unit (ms).
pub const DEFAULT_SESSION_BACKOFF_MS: u64 = 100;

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Pool sizing and lifetime settings.
///
/// # Invariants
/// - `pool_size + max_overflow` is at least one.
/// - `timeout_ms` is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections kept warm.
    pub pool_size: u32,
    /// Extra connections allowed under burst load.
    pub max_overflow: u32,
    /// Checkout timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum connection age in seconds; zero disables recycling.
    pub recycle_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            recycle_secs: DEFAULT_POOL_RECYCLE_SECS,
        }
    }
}

impl PoolSettings {
    /// Returns the hard connection ceiling.
    #[must_use]
    pub const fn max_size(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] when the pool could never hand out a
    /// connection.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_size() == 0 {
            return Err(SessionError::Invalid(
                "pool_size + max_overflow must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(SessionError::Invalid("pool timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Returns the recycle age, if enabled.
    fn recycle(&self) -> Option<Duration> {
        (self.recycle_secs > 0).then(|| Duration::from_secs(self.recycle_secs))
    }
}

/// Retry policy for session acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionRetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Backoff unit multiplied by the attempt number.
    pub backoff_ms: u64,
}

impl Default for SessionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SESSION_ATTEMPTS,
            backoff_ms: DEFAULT_SESSION_BACKOFF_MS,
        }
    }
}

impl SessionRetryPolicy {
    /// Returns the linear backoff after the given failed attempt (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

// ============================================================================
// SECTION: Session Manager
// ============================================================================

/// Pooled session source for one backend.
pub struct SessionManager<B: StoreBackend> {
    /// Backend capabilities.
    backend: B,
    /// Pool settings.
    settings: PoolSettings,
    /// Acquisition retry policy.
    retry: SessionRetryPolicy,
    /// Current pool; `None` once disposed.
    pool: RwLock<Option<Pool<B::Manager>>>,
    /// Number of pool rebuilds since construction.
    generation: AtomicU64,
}

impl<B: StoreBackend> SessionManager<B> {
    /// Creates the manager. Connections open lazily on first checkout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the settings are invalid or the backend
    /// cannot produce a connection manager.
    pub fn new(
        backend: B,
        settings: PoolSettings,
        retry: SessionRetryPolicy,
    ) -> Result<Self, SessionError> {
        settings.validate()?;
        let pool = build_pool(&backend, &settings)?;
        info!(
            backend = backend.kind().as_str(),
            pool_size = settings.pool_size,
            max_overflow = settings.max_overflow,
            "session manager ready"
        );
        Ok(Self {
            backend,
            settings,
            retry,
            pool: RwLock::new(Some(pool)),
            generation: AtomicU64::new(0),
        })
    }

    /// Returns the backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the backend family.
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Returns the pool settings.
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Returns how many times the pool has been rebuilt.
    pub fn pool_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns true once [`SessionManager::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Refreshes credentials and replaces the pool.
    ///
    /// Sessions already checked out keep their connection; it is closed when
    /// they release it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when credentials cannot be refreshed, the new
    /// pool cannot be built, or the manager was disposed.
    pub fn reset_pool(&self) -> Result<(), SessionError> {
        self.backend.refresh_credentials()?;
        let pool = build_pool(&self.backend, &self.settings)?;
        let previous = {
            let mut guard = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                return Err(SessionError::Disposed);
            }
            guard.replace(pool)
        };
        drop(previous);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(backend = self.backend.kind().as_str(), generation, "connection pool rebuilt");
        Ok(())
    }

    /// Closes the pool. Later checkouts fail with [`SessionError::Disposed`].
    pub fn dispose(&self) {
        let previous = self.pool.write().unwrap_or_else(PoisonError::into_inner).take();
        if previous.is_some() {
            info!(backend = self.backend.kind().as_str(), "session manager disposed");
        }
    }

    /// Checks out one connection and proves it is alive.
    fn checkout(&self) -> Result<PooledConnection<B::Manager>, SessionError> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or(SessionError::Disposed)?;
        let mut connection = pool.get().map_err(|err| SessionError::from_pool(&err))?;
        self.backend.ping(&mut connection)?;
        Ok(connection)
    }

    /// Acquires a healthy session.
    ///
    /// # Errors
    ///
    /// Returns the last [`SessionError`] once attempts are exhausted, or the
    /// first non-connection error immediately.
    pub fn acquire_session(&self) -> Result<Session<'_, B>, SessionError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.checkout() {
                Ok(connection) => {
                    if attempt > 1 {
                        debug!(attempt, "session acquired after retry");
                    }
                    return Ok(Session {
                        manager: self,
                        connection,
                        in_transaction: false,
                    });
                }
                Err(error) if error.is_connection_class() && attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %error,
                        "session acquisition failed; resetting pool"
                    );
                    if let Err(reset_error) = self.reset_pool() {
                        if reset_error == SessionError::Disposed {
                            return Err(reset_error);
                        }
                        warn!(error = %reset_error, "pool reset failed");
                    }
                    thread::sleep(self.retry.delay(attempt));
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Runs `operation` in a deferred transaction.
    ///
    /// # Errors
    ///
    /// Returns the operation's error or any acquisition, begin, or commit
    /// failure. The transaction is rolled back on every error path.
    pub fn with_session<T, F>(&self, operation: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Session<'_, B>) -> Result<T, SessionError>,
    {
        self.with_session_mode(TransactionMode::Deferred, operation)
    }

    /// Runs `operation` in a transaction started with `mode`.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::with_session`].
    pub fn with_session_mode<T, F>(
        &self,
        mode: TransactionMode,
        operation: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Session<'_, B>) -> Result<T, SessionError>,
    {
        let mut session = self.acquire_session()?;
        let outcome = session
            .begin(mode)
            .and_then(|()| operation(&mut session))
            .and_then(|value| session.commit().map(|()| value));
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                session.rollback_quietly();
                drop(session);
                if error.requires_pool_reset() {
                    warn!(error = %error, "session failed with connection error; resetting pool");
                    if let Err(reset_error) = self.reset_pool() {
                        warn!(error = %reset_error, "pool reset failed");
                    }
                }
                Err(error)
            }
        }
    }

    /// Upgrades the schema through one dedicated session.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when acquisition or any revision fails.
    pub fn upgrade_schema(
        &self,
        engine: &MigrationEngine,
        target: Option<&str>,
    ) -> Result<UpgradeReport, MigrationError> {
        let mut session = self.acquire_session()?;
        let mut migration = session.migration_target();
        engine.upgrade(migration.as_mut(), target)
    }
}

/// Builds a lazily-connecting pool.
fn build_pool<B: StoreBackend>(
    backend: &B,
    settings: &PoolSettings,
) -> Result<Pool<B::Manager>, SessionError> {
    let manager = backend.connection_manager()?;
    let max_size = settings.max_size();
    Ok(Pool::builder()
        .max_size(max_size)
        .min_idle(Some(settings.pool_size.min(max_size)))
        .connection_timeout(Duration::from_millis(settings.timeout_ms))
        .max_lifetime(settings.recycle())
        .idle_timeout(settings.recycle())
        .test_on_check_out(false)
        .build_unchecked(manager))
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// One checked-out connection with transaction tracking.
pub struct Session<'m, B: StoreBackend> {
    /// Owning manager.
    manager: &'m SessionManager<B>,
    /// Pooled connection.
    connection: PooledConnection<B::Manager>,
    /// True between begin and commit/rollback.
    in_transaction: bool,
}

impl<B: StoreBackend> Session<'_, B> {
    /// Returns the backend family.
    pub fn kind(&self) -> BackendKind {
        self.manager.backend.kind()
    }

    /// Returns the raw driver connection.
    pub fn connection(&mut self) -> &mut BackendConnection<B> {
        &mut self.connection
    }

    /// Returns true while a transaction is open.
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] when one is already open, or the
    /// backend's error.
    pub fn begin(&mut self, mode: TransactionMode) -> Result<(), SessionError> {
        if self.in_transaction {
            return Err(SessionError::Invalid("transaction already open".to_string()));
        }
        self.manager.backend.begin(&mut self.connection, mode)?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commits the open transaction, if any.
    ///
    /// A failed commit leaves the transaction marked open so the caller or
    /// the drop guard rolls it back.
    ///
    /// # Errors
    ///
    /// Returns the backend's commit error.
    pub fn commit(&mut self) -> Result<(), SessionError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.manager.backend.commit(&mut self.connection)?;
        self.in_transaction = false;
        Ok(())
    }

    /// Rolls back the open transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's rollback error.
    pub fn rollback(&mut self) -> Result<(), SessionError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.manager.backend.rollback(&mut self.connection)
    }

    /// Executes an upsert and returns the surviving row id.
    ///
    /// # Errors
    ///
    /// Returns the backend's statement error.
    pub fn upsert(&mut self, upsert: &Upsert) -> Result<String, SessionError> {
        self.manager.backend.upsert(&mut self.connection, upsert)
    }

    /// Wraps this session's connection for the migration engine.
    pub fn migration_target(&mut self) -> Box<dyn MigrationTarget + '_> {
        self.manager.backend.migration_target(&mut self.connection)
    }

    /// Rolls back, logging instead of returning failures.
    fn rollback_quietly(&mut self) {
        if let Err(error) = self.rollback() {
            warn!(error = %error, "rollback failed");
        }
    }
}

impl<B: StoreBackend> Drop for Session<'_, B> {
    fn drop(&mut self) {
        if self.in_transaction {
            self.rollback_quietly();
        }
    }
}
