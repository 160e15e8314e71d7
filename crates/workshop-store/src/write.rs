// crates/workshop-store/src/write.rs
// ============================================================================
// Module: Write Coordination
// Description: Upsert statements and contention-aware write retries.
// Purpose: Make concurrent writers on the same logical key converge on one
//          row instead of failing or duplicating.
// Dependencies: rand, serde, thiserror, tracing, uuid
// ============================================================================

//! ## Overview
//! Writes that race on a natural key are expressed as an [`Upsert`]: a single
//! `INSERT ... ON CONFLICT (keys) DO UPDATE` statement that is atomic on both
//! backends. The [`WriteCoordinator`] runs write closures in an immediate
//! transaction and retries contention faults (lock busy, unique-key races)
//! with full-jitter exponential backoff. When attempts run out the caller
//! gets [`WriteError::TemporarilyUnavailable`], which an HTTP layer maps to a
//! 503 response.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::backend::StoreBackend;
use crate::backend::TransactionMode;
use crate::backend::is_valid_identifier;
use crate::error::SessionError;
use crate::session::Session;
use crate::session::SessionManager;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default number of write attempts.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 5;
/// Default base backoff delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;
/// Default backoff ceiling in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;
/// Largest shift applied when doubling the backoff.
const MAX_BACKOFF_SHIFT: u32 = 16;

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Retry policy for contended writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WriteRetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Base delay doubled per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WRITE_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl WriteRetryPolicy {
    /// Returns the backoff ceiling after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let exponential = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }

    /// Picks a full-jitter delay in `[0, ceiling]`.
    #[must_use]
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced to write callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Contention persisted through every attempt.
    #[error("database temporarily unavailable after {attempts} attempts: {message}")]
    TemporarilyUnavailable {
        /// Attempts made.
        attempts: u32,
        /// Last contention message.
        message: String,
    },
    /// Non-contention failure.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl WriteError {
    /// Returns true when the caller should answer "service unavailable".
    #[must_use]
    pub const fn is_temporarily_unavailable(&self) -> bool {
        matches!(self, Self::TemporarilyUnavailable { .. })
    }
}

// ============================================================================
// SECTION: Upsert
// ============================================================================

/// Bound value for an upsert column. `None` binds a typed NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Text column.
    Text(Option<String>),
    /// 64-bit integer column.
    Integer(Option<i64>),
    /// Double precision column.
    Real(Option<f64>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(Some(value.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(Some(value))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(Some(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(Some(value))
    }
}

/// Bind parameter syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?1, ?2, ...` (`SQLite`).
    QuestionNumbered,
    /// `$1, $2, ...` (Postgres).
    DollarNumbered,
}

impl PlaceholderStyle {
    /// Renders the 1-based placeholder.
    fn render(self, index: usize) -> String {
        match self {
            Self::QuestionNumbered => format!("?{index}"),
            Self::DollarNumbered => format!("${index}"),
        }
    }
}

/// Insert-or-update keyed on a natural key.
///
/// The generated row id is only used when the insert wins; on conflict the
/// existing row keeps its id and `RETURNING` reports that id.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    /// Target table.
    table: String,
    /// Surrogate key column.
    id_column: String,
    /// Surrogate key used if this upsert inserts.
    id: String,
    /// Natural-key columns (the conflict target).
    keys: Vec<(String, SqlValue)>,
    /// Columns overwritten on conflict.
    values: Vec<(String, SqlValue)>,
}

impl Upsert {
    /// Starts an upsert into `table` with an `id` surrogate key.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id_column: "id".to_string(),
            id: Uuid::new_v4().to_string(),
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Adds a natural-key column.
    #[must_use]
    pub fn key(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.keys.push((column.into(), value.into()));
        self
    }

    /// Adds a column that is written on insert and overwritten on conflict.
    #[must_use]
    pub fn value(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Returns the surrogate id used if this upsert inserts.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Renders the statement.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] for invalid or duplicate column
    /// names, or when no key column was given.
    pub fn statement(&self, style: PlaceholderStyle) -> Result<String, SessionError> {
        if self.keys.is_empty() {
            return Err(SessionError::Invalid(format!("upsert into {} has no key columns", self.table)));
        }
        let columns: Vec<&str> = std::iter::once(self.id_column.as_str())
            .chain(self.keys.iter().map(|(column, _)| column.as_str()))
            .chain(self.values.iter().map(|(column, _)| column.as_str()))
            .collect();
        for name in std::iter::once(self.table.as_str()).chain(columns.iter().copied()) {
            if !is_valid_identifier(name) {
                return Err(SessionError::Invalid(format!("invalid identifier: '{name}'")));
            }
        }
        for (index, column) in columns.iter().enumerate() {
            if columns[.. index].contains(column) {
                return Err(SessionError::Invalid(format!("duplicate upsert column {column}")));
            }
        }
        let placeholders: Vec<String> = (1 ..= columns.len()).map(|index| style.render(index)).collect();
        let conflict: Vec<&str> = self.keys.iter().map(|(column, _)| column.as_str()).collect();
        let assignments: Vec<String> = if self.values.is_empty() {
            vec![format!("{0} = excluded.{0}", conflict[0])]
        } else {
            self.values.iter().map(|(column, _)| format!("{column} = excluded.{column}")).collect()
        };
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {} RETURNING {}",
            self.table,
            columns.join(", "),
            placeholders.join(", "),
            conflict.join(", "),
            assignments.join(", "),
            self.id_column
        ))
    }

    /// Returns bound parameters in statement order.
    #[must_use]
    pub fn parameters(&self) -> Vec<SqlValue> {
        std::iter::once(SqlValue::Text(Some(self.id.clone())))
            .chain(self.keys.iter().map(|(_, value)| value.clone()))
            .chain(self.values.iter().map(|(_, value)| value.clone()))
            .collect()
    }
}

/// An annotation keyed on `(user_id, trace_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AnnotationUpsert {
    /// Owning workshop.
    pub workshop_id: String,
    /// Annotated trace.
    pub trace_id: String,
    /// Annotating user.
    pub user_id: String,
    /// Primary rating.
    pub rating: i64,
    /// Per-question ratings as a JSON document.
    pub ratings: Option<String>,
    /// Free-text comment.
    pub comment: Option<String>,
}

impl AnnotationUpsert {
    /// Builds the upsert statement for this annotation.
    #[must_use]
    pub fn to_upsert(&self) -> Upsert {
        Upsert::new("annotations")
            .key("user_id", self.user_id.as_str())
            .key("trace_id", self.trace_id.as_str())
            .value("workshop_id", self.workshop_id.as_str())
            .value("rating", self.rating)
            .value("ratings", self.ratings.clone())
            .value("comment", self.comment.clone())
    }
}

// ============================================================================
// SECTION: Coordinator
// ============================================================================

/// Runs write closures with contention retries.
pub struct WriteCoordinator<B: StoreBackend> {
    /// Session source.
    sessions: Arc<SessionManager<B>>,
    /// Retry policy.
    policy: WriteRetryPolicy,
}

impl<B: StoreBackend> WriteCoordinator<B> {
    /// Creates a coordinator over a shared session manager.
    #[must_use]
    pub const fn new(sessions: Arc<SessionManager<B>>, policy: WriteRetryPolicy) -> Self {
        Self {
            sessions,
            policy,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &WriteRetryPolicy {
        &self.policy
    }

    /// Runs `operation` in an immediate transaction, retrying contention.
    ///
    /// The closure may run more than once and must not have side effects
    /// outside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::TemporarilyUnavailable`] when contention
    /// outlasts the policy, or [`WriteError::Session`] for anything else.
    pub fn execute<T, F>(&self, mut operation: F) -> Result<T, WriteError>
    where
        F: FnMut(&mut Session<'_, B>) -> Result<T, SessionError>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sessions.with_session_mode(TransactionMode::Immediate, |session| operation(session)) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "write succeeded after contention retries");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_contention() => {
                    if attempt >= attempts {
                        warn!(attempts = attempt, error = %error, "write contention exhausted retries");
                        return Err(WriteError::TemporarilyUnavailable {
                            attempts: attempt,
                            message: error.to_string(),
                        });
                    }
                    let delay = self.policy.jittered_delay(attempt, &mut rand::thread_rng());
                    debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "write contention; backing off"
                    );
                    thread::sleep(delay);
                }
                Err(error) => return Err(WriteError::Session(error)),
            }
        }
    }

    /// Executes a single upsert and returns the surviving row id.
    ///
    /// # Errors
    ///
    /// See [`WriteCoordinator::execute`].
    pub fn upsert(&self, upsert: &Upsert) -> Result<String, WriteError> {
        self.execute(|session| session.upsert(upsert))
    }

    /// Writes an annotation keyed on `(user_id, trace_id)`.
    ///
    /// # Errors
    ///
    /// See [`WriteCoordinator::execute`].
    pub fn upsert_annotation(&self, annotation: &AnnotationUpsert) -> Result<String, WriteError> {
        self.upsert(&annotation.to_upsert())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
