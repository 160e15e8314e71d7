// crates/workshop-store/src/error.rs
// ============================================================================
// Module: Store Errors
// Description: Error taxonomy and transient-fault classification.
// Purpose: Decide which database faults are retried and at which layer.
// Dependencies: postgres, r2d2, rusqlite, thiserror
// ============================================================================

//! ## Overview
//! Every driver error that crosses the store boundary is folded into a
//! [`SessionError`]. The variant decides the retry policy:
//! - connection-class faults ([`SessionError::Connection`],
//!   [`SessionError::Pool`], [`SessionError::Busy`]) are retried by the
//!   session manager during acquisition;
//! - contention-class faults ([`SessionError::Busy`] and unique-key
//!   [`SessionError::Constraint`] races) are retried by the write
//!   coordinator;
//! - everything else propagates immediately.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::error::Error as StdError;
use std::io;

use postgres::error::SqlState;
use rusqlite::ErrorCode;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lower-cased message fragments that mark a fault as connection-class.
pub const CONNECTION_ERROR_MARKERS: [&str; 9] = [
    "database is locked",
    "connection reset",
    "connection refused",
    "connection timed out",
    "could not connect to server",
    "terminating connection",
    "server closed the connection unexpectedly",
    "ssl connection has been closed unexpectedly",
    "invalid authorization",
];

/// `SQLite` extended result code for a UNIQUE constraint failure.
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
/// `SQLite` extended result code for a PRIMARY KEY constraint failure.
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Session, pool, and statement errors.
///
/// # Invariants
/// - Messages carry driver text only; bound parameter values are never
///   embedded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport-level fault: dropped socket, refused connection, expired
    /// credentials, unopenable file.
    #[error("database connection error: {0}")]
    Connection(String),
    /// Pool checkout failed or timed out.
    #[error("database pool error: {0}")]
    Pool(String),
    /// Lock contention on the database file or a server row lock.
    #[error("database busy: {0}")]
    Busy(String),
    /// Constraint violation.
    #[error("database constraint violation: {message}")]
    Constraint {
        /// Driver message.
        message: String,
        /// True when the violated constraint is a uniqueness constraint.
        unique: bool,
    },
    /// Any other engine error (syntax, missing table, type mismatch).
    #[error("database error: {0}")]
    Database(String),
    /// Invalid caller input or configuration.
    #[error("invalid database request: {0}")]
    Invalid(String),
    /// The session manager was disposed.
    #[error("session manager disposed")]
    Disposed,
}

impl SessionError {
    /// Returns true when the fault is transient at the connection layer.
    #[must_use]
    pub const fn is_connection_class(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Pool(_) | Self::Busy(_))
    }

    /// Returns true when the pool must be rebuilt before reuse.
    ///
    /// Lock contention leaves the connection healthy, so [`Self::Busy`] does
    /// not force a rebuild.
    #[must_use]
    pub const fn requires_pool_reset(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Pool(_))
    }

    /// Returns true when a competing writer caused the failure.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::Busy(_)
                | Self::Constraint {
                    unique: true,
                    ..
                }
        )
    }

    /// Folds a `SQLite` driver error into the taxonomy.
    #[must_use]
    pub fn from_sqlite(error: &rusqlite::Error) -> Self {
        let message = error.to_string();
        match error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::Busy(message),
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => Self::Connection(message),
                ErrorCode::ConstraintViolation => Self::Constraint {
                    unique: matches!(
                        failure.extended_code,
                        SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY
                    ),
                    message,
                },
                _ => Self::from_message(message),
            },
            _ => Self::from_message(message),
        }
    }

    /// Folds a Postgres driver error into the taxonomy.
    #[must_use]
    pub fn from_postgres(error: &postgres::Error) -> Self {
        let message = error.to_string();
        if error.is_closed() {
            return Self::Connection(message);
        }
        match error.code() {
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => Self::Constraint {
                message,
                unique: true,
            },
            Some(code)
                if *code == SqlState::NOT_NULL_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION
                    || *code == SqlState::CHECK_VIOLATION =>
            {
                Self::Constraint {
                    message,
                    unique: false,
                }
            }
            Some(code)
                if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::LOCK_NOT_AVAILABLE =>
            {
                Self::Busy(message)
            }
            Some(code)
                if *code == SqlState::ADMIN_SHUTDOWN
                    || *code == SqlState::CRASH_SHUTDOWN
                    || *code == SqlState::CANNOT_CONNECT_NOW
                    || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
                    || *code == SqlState::INVALID_PASSWORD =>
            {
                Self::Connection(message)
            }
            Some(_) => Self::from_message(message),
            None if error.as_db_error().is_none() && error.source().is_some() => {
                Self::Connection(message)
            }
            None => Self::from_message(message),
        }
    }

    /// Folds a pool checkout error into the taxonomy.
    #[must_use]
    pub fn from_pool(error: &r2d2::Error) -> Self {
        Self::Pool(error.to_string())
    }

    /// Classifies an error purely by its message text.
    fn from_message(message: String) -> Self {
        if message_marks_connection_error(&message) {
            if message.to_ascii_lowercase().contains("database is locked") {
                Self::Busy(message)
            } else {
                Self::Connection(message)
            }
        } else {
            Self::Database(message)
        }
    }
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Returns true when the message contains a known connection-class marker.
#[must_use]
pub fn message_marks_connection_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CONNECTION_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Returns true when an arbitrary error is connection-class.
///
/// Walks the source chain. Driver error types are classified structurally;
/// anything else falls back to message matching.
#[must_use]
pub fn is_connection_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(candidate) = current {
        if classify_known(candidate) == Some(true) {
            return true;
        }
        if message_marks_connection_error(&candidate.to_string()) {
            return true;
        }
        current = candidate.source();
    }
    false
}

/// Structural classification for error types the store knows about.
fn classify_known(error: &(dyn StdError + 'static)) -> Option<bool> {
    if let Some(session) = error.downcast_ref::<SessionError>() {
        return Some(session.is_connection_class());
    }
    if let Some(sqlite) = error.downcast_ref::<rusqlite::Error>() {
        return Some(SessionError::from_sqlite(sqlite).is_connection_class());
    }
    if let Some(pg) = error.downcast_ref::<postgres::Error>() {
        return Some(SessionError::from_postgres(pg).is_connection_class());
    }
    if error.downcast_ref::<r2d2::Error>().is_some() {
        return Some(true);
    }
    if let Some(io_error) = error.downcast_ref::<io::Error>() {
        return Some(matches!(
            io_error.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ));
    }
    None
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::panic,
        clippy::use_debug,
        reason = "Test-only assertions."
    )]

    use std::io;

    use rusqlite::ffi;

    use super::SessionError;
    use super::is_connection_error;

    /// Plain error type carrying only a message.
    #[derive(Debug)]
    struct MessageError(&'static str);

    impl std::fmt::Display for MessageError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for MessageError {}

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn message_table_classifies_exactly() {
        let table: [(&'static str, bool); 14] = [
            ("database is locked", true),
            ("Database Is Locked", true),
            ("connection reset by peer", true),
            ("Connection refused (os error 111)", true),
            ("connection timed out", true),
            ("could not connect to server: No such file", true),
            ("FATAL: terminating connection due to administrator command", true),
            ("server closed the connection unexpectedly", true),
            ("SSL connection has been closed unexpectedly", true),
            ("invalid authorization specification", true),
            ("invalid syntax near SELECT", false),
            ("UNIQUE constraint failed: annotations.user_id", false),
            ("no such table: traces", false),
            ("", false),
        ];
        for (message, expected) in table {
            assert_eq!(
                is_connection_error(&MessageError(message)),
                expected,
                "classification mismatch for {message:?}"
            );
        }
    }

    #[test]
    fn driver_types_classify_structurally() {
        assert!(is_connection_error(&sqlite_failure(ffi::SQLITE_BUSY)));
        assert!(is_connection_error(&sqlite_failure(ffi::SQLITE_LOCKED)));
        assert!(is_connection_error(&sqlite_failure(ffi::SQLITE_CANTOPEN)));
        assert!(!is_connection_error(&sqlite_failure(ffi::SQLITE_CONSTRAINT_UNIQUE)));
        assert!(!is_connection_error(&sqlite_failure(ffi::SQLITE_ERROR)));
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn sqlite_unique_violation_is_contention_not_connection() {
        let error = SessionError::from_sqlite(&sqlite_failure(ffi::SQLITE_CONSTRAINT_UNIQUE));
        assert!(error.is_contention());
        assert!(!error.is_connection_class());
        let not_null = SessionError::from_sqlite(&sqlite_failure(ffi::SQLITE_CONSTRAINT_NOTNULL));
        assert!(!not_null.is_contention());
    }

    #[test]
    fn busy_is_connection_class_without_pool_reset() {
        let error = SessionError::from_sqlite(&sqlite_failure(ffi::SQLITE_BUSY));
        assert!(error.is_connection_class());
        assert!(error.is_contention());
        assert!(!error.requires_pool_reset());
        assert!(SessionError::Connection("reset".to_string()).requires_pool_reset());
    }

    #[test]
    fn source_chain_is_walked() {
        let wrapped = io::Error::other(MessageError("server closed the connection unexpectedly"));
        assert!(is_connection_error(&wrapped));
    }
}
