// crates/workshop-store/src/migrate.rs
// ============================================================================
// Module: Schema Migration Engine
// Description: Revision DAG, head tracking, and idempotent upgrade runner.
// Purpose: Converge fresh, versioned, and hand-patched legacy databases onto
//          one canonical schema.
// Dependencies: thiserror, tracing
// ============================================================================

//! ## Overview
//! A schema history is a DAG of [`Revision`]s. Each revision names zero, one,
//! or two parents; two parents make it a merge point that converges branches.
//! The database records its current *head set* in the `schema_revision`
//! table: one row once converged, several while parallel branches are only
//! partly applied. The applied set is the ancestor closure of those heads.
//!
//! [`MigrationEngine::upgrade`] walks the unapplied ancestors of the target
//! in topological order. Every revision runs in its own transaction together
//! with the head-set update, so a failure leaves the marker at the last
//! revision that committed. The head set is re-read inside that transaction;
//! a revision that a concurrent process already applied is skipped.
//!
//! Upgrade steps talk to the database only through [`SchemaOps`]. Steps must
//! check live state before mutating (see [`add_column_if_missing`] and
//! friends) because a legacy database may already carry the change from an
//! ad hoc `ALTER TABLE` that predates the migration history.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::backend::BackendKind;
use crate::backend::is_valid_identifier;
use crate::error::SessionError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Table that records the current head set.
pub const REVISION_TABLE: &str = "schema_revision";
/// Maximum number of parents a revision may declare.
const MAX_PARENTS: usize = 2;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Migration engine errors.
#[derive(Debug, Error, Clone)]
pub enum MigrationError {
    /// The revision history itself is malformed.
    #[error("invalid revision history: {0}")]
    InvalidHistory(String),
    /// The database records a revision this build does not know.
    #[error("unknown schema revision: {0}")]
    UnknownRevision(String),
    /// The database has several heads where one was required.
    #[error("database has multiple schema heads: {}", .0.join(", "))]
    MultipleHeads(Vec<String>),
    /// A revision was attempted before one of its parents.
    #[error("revision {revision} requires parent {parent} to be applied first")]
    UnappliedParent {
        /// Revision being applied.
        revision: String,
        /// Missing parent.
        parent: String,
    },
    /// A revision step failed; the transaction was rolled back.
    #[error("schema revision {revision} failed: {source}")]
    Step {
        /// Revision that failed.
        revision: String,
        /// Underlying failure.
        #[source]
        source: Box<MigrationError>,
    },
    /// A step was handed invalid input (bad identifier, missing table).
    #[error("invalid migration step: {0}")]
    Invalid(String),
    /// Engine error while running a statement.
    #[error("migration database error: {0}")]
    Database(String),
    /// Session acquisition failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl MigrationError {
    /// Returns the innermost error, unwrapping [`MigrationError::Step`].
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Step {
                source,
                ..
            } => source.root_cause(),
            other => other,
        }
    }
}

// ============================================================================
// SECTION: Revisions
// ============================================================================

/// A single upgrade or downgrade procedure.
pub type StepFn = fn(&mut dyn SchemaOps) -> Result<(), MigrationError>;

/// Downgrade behavior for a revision.
#[derive(Debug, Clone, Copy)]
pub enum Downgrade {
    /// Reverse the revision with the given step.
    Steps(StepFn),
    /// The revision is destructive to reverse (dropping columns needs a table
    /// rebuild on the embedded backend); downgrading only moves the marker.
    Irreversible,
}

/// One node of the schema history.
#[derive(Debug, Clone, Copy)]
pub struct Revision {
    /// Unique revision identifier.
    pub id: &'static str,
    /// Parent revisions; empty for a root, two for a merge point.
    pub parents: &'static [&'static str],
    /// Human-readable summary.
    pub description: &'static str,
    /// Upgrade procedure.
    pub upgrade: StepFn,
    /// Downgrade procedure.
    pub downgrade: Downgrade,
}

impl Revision {
    /// Creates an irreversible revision.
    #[must_use]
    pub const fn new(
        id: &'static str,
        parents: &'static [&'static str],
        description: &'static str,
        upgrade: StepFn,
    ) -> Self {
        Self {
            id,
            parents,
            description,
            upgrade,
            downgrade: Downgrade::Irreversible,
        }
    }

    /// Attaches a downgrade step.
    #[must_use]
    pub const fn with_downgrade(mut self, downgrade: StepFn) -> Self {
        self.downgrade = Downgrade::Steps(downgrade);
        self
    }

    /// Returns true when the revision converges two branches.
    #[must_use]
    pub const fn is_merge(&self) -> bool {
        self.parents.len() == MAX_PARENTS
    }
}

/// Step used by merge revisions and marker-only operations.
///
/// # Errors
///
/// Never fails.
pub fn no_op(_ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    Ok(())
}

// ============================================================================
// SECTION: Schema Introspection
// ============================================================================

/// Column metadata read from the live database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type as reported by the catalog.
    pub declared_type: String,
    /// True when NULL is allowed.
    pub nullable: bool,
    /// True when the column is part of the primary key.
    pub primary_key: bool,
}

/// Desired table shape for a rebuild.
///
/// On the embedded backend the table is recreated from `columns` and
/// `constraints` and rows are copied for every column present in both
/// shapes; existing columns `columns` does not name are kept as they are.
/// On the server backend `server_statements` run in order instead.
#[derive(Debug, Clone, Copy)]
pub struct TableRebuild<'a> {
    /// Table to rebuild.
    pub table: &'a str,
    /// Full column definitions; the first word of each is the column name.
    pub columns: &'a [&'a str],
    /// Table-level constraints.
    pub constraints: &'a [&'a str],
    /// In-place `ALTER` statements for servers that support them.
    pub server_statements: &'a [&'a str],
}

impl TableRebuild<'_> {
    /// Returns the column names declared by the new shape.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|definition| definition.split_whitespace().next())
            .collect()
    }

    /// Returns the body of the `CREATE TABLE` statement.
    #[must_use]
    pub fn create_body(&self) -> String {
        self.columns
            .iter()
            .chain(self.constraints.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(",\n    ")
    }
}

/// Schema operations available to revision steps.
///
/// Implemented once per backend so the same step code runs against the
/// embedded file and the server.
pub trait SchemaOps {
    /// Returns the backend family.
    fn backend_kind(&self) -> BackendKind;

    /// Returns true when the table exists.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the catalog query fails.
    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError>;

    /// Returns the table's columns; empty when the table is absent.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the catalog query fails.
    fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, MigrationError>;

    /// Returns true when the index exists.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the catalog query fails.
    fn index_exists(&mut self, index: &str) -> Result<bool, MigrationError>;

    /// Executes one or more DDL/DML statements.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when a statement fails.
    fn execute(&mut self, sql: &str) -> Result<(), MigrationError>;

    /// Rebuilds a table into a new shape.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when any stage of the rebuild fails; the
    /// enclosing transaction rolls the partial state back.
    fn rebuild_table(&mut self, rebuild: &TableRebuild<'_>) -> Result<(), MigrationError>;
}

/// Plans the head set for a step given the heads read inside its transaction.
///
/// Returns `None` when the step should be skipped.
pub type HeadPlanner<'a> =
    dyn FnMut(&[String]) -> Result<Option<Vec<String>>, MigrationError> + 'a;

/// Database handle the engine migrates.
pub trait MigrationTarget {
    /// Returns the backend family.
    fn backend_kind(&self) -> BackendKind;

    /// Returns true when the revision marker table exists.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the catalog query fails.
    fn marker_exists(&mut self) -> Result<bool, MigrationError>;

    /// Creates the revision marker table when missing.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the table cannot be created.
    fn ensure_marker(&mut self) -> Result<(), MigrationError>;

    /// Reads the recorded head set; empty when no marker exists.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the marker cannot be read.
    fn read_heads(&mut self) -> Result<Vec<String>, MigrationError>;

    /// Returns true when the table exists (legacy probing).
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the catalog query fails.
    fn table_exists(&mut self, table: &str) -> Result<bool, MigrationError>;

    /// Runs `step` and records the planned head set in one transaction.
    ///
    /// Returns `false` when the planner skipped the step.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when planning, the step, or the marker
    /// update fails; nothing is committed in that case.
    fn run_step(&mut self, step: StepFn, plan: &mut HeadPlanner<'_>)
    -> Result<bool, MigrationError>;
}

// ============================================================================
// SECTION: Step Helpers
// ============================================================================

/// Rejects identifiers that cannot be interpolated safely into DDL.
fn ensure_identifier(name: &str) -> Result<(), MigrationError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(MigrationError::Invalid(format!("invalid identifier: '{name}'")))
    }
}

/// Returns true when the column exists on the table.
///
/// # Errors
///
/// Returns [`MigrationError`] when the catalog query fails.
pub fn column_exists(
    ops: &mut dyn SchemaOps,
    table: &str,
    column: &str,
) -> Result<bool, MigrationError> {
    Ok(ops.columns(table)?.iter().any(|info| info.name.eq_ignore_ascii_case(column)))
}

/// Returns the column's nullability, or `None` when it does not exist.
///
/// # Errors
///
/// Returns [`MigrationError`] when the catalog query fails.
pub fn column_nullable(
    ops: &mut dyn SchemaOps,
    table: &str,
    column: &str,
) -> Result<Option<bool>, MigrationError> {
    Ok(ops
        .columns(table)?
        .into_iter()
        .find(|info| info.name.eq_ignore_ascii_case(column))
        .map(|info| info.nullable))
}

/// Creates the table unless it already exists. Returns true when created.
///
/// # Errors
///
/// Returns [`MigrationError`] on invalid identifiers or statement failure.
pub fn create_table_if_missing(
    ops: &mut dyn SchemaOps,
    table: &str,
    body: &str,
) -> Result<bool, MigrationError> {
    ensure_identifier(table)?;
    if ops.table_exists(table)? {
        debug!(table, "table already present");
        return Ok(false);
    }
    ops.execute(&format!("CREATE TABLE {table} (\n    {body}\n)"))?;
    Ok(true)
}

/// Adds the column unless it already exists. Returns true when added.
///
/// # Errors
///
/// Returns [`MigrationError`] when the table is missing, an identifier is
/// invalid, or the statement fails.
pub fn add_column_if_missing(
    ops: &mut dyn SchemaOps,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<bool, MigrationError> {
    ensure_identifier(table)?;
    ensure_identifier(column)?;
    if !ops.table_exists(table)? {
        return Err(MigrationError::Invalid(format!("table {table} does not exist")));
    }
    if column_exists(ops, table, column)? {
        debug!(table, column, "column already present");
        return Ok(false);
    }
    ops.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    Ok(true)
}

/// Creates the index unless it already exists. Returns true when created.
///
/// # Errors
///
/// Returns [`MigrationError`] on invalid identifiers or statement failure.
pub fn create_index_if_missing(
    ops: &mut dyn SchemaOps,
    index: &str,
    table: &str,
    columns: &[&str],
    unique: bool,
) -> Result<bool, MigrationError> {
    ensure_identifier(index)?;
    ensure_identifier(table)?;
    for column in columns {
        ensure_identifier(column)?;
    }
    if columns.is_empty() {
        return Err(MigrationError::Invalid(format!("index {index} has no columns")));
    }
    if ops.index_exists(index)? {
        debug!(index, "index already present");
        return Ok(false);
    }
    let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
    ops.execute(&format!("CREATE {kind} {index} ON {table} ({})", columns.join(", ")))?;
    Ok(true)
}

/// Drops the index if it exists. Returns true when dropped.
///
/// # Errors
///
/// Returns [`MigrationError`] on invalid identifiers or statement failure.
pub fn drop_index_if_exists(ops: &mut dyn SchemaOps, index: &str) -> Result<bool, MigrationError> {
    ensure_identifier(index)?;
    if !ops.index_exists(index)? {
        return Ok(false);
    }
    ops.execute(&format!("DROP INDEX {index}"))?;
    Ok(true)
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// What the engine found before touching the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseState {
    /// No marker and none of the probe tables.
    Fresh,
    /// No marker but application tables exist (pre-migration database).
    Legacy {
        /// Probe tables that were found.
        tables: Vec<String>,
    },
    /// Marker present with the recorded heads.
    Versioned {
        /// Recorded head set.
        heads: Vec<String>,
    },
}

/// Outcome of an upgrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    /// State detected before the run.
    pub starting_state: DatabaseState,
    /// Revisions executed by this run, in order.
    pub applied: Vec<String>,
    /// Revisions found already applied by a concurrent run.
    pub skipped: Vec<String>,
}

/// Validated revision history plus the upgrade/downgrade runner.
///
/// # Invariants
/// - `revisions` is in topological order (parents before children).
/// - Exactly one revision has no children (`head`).
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    /// Revisions in topological order.
    revisions: Vec<Revision>,
    /// Revision id to position in `revisions`.
    positions: BTreeMap<&'static str, usize>,
    /// Revision id to child ids.
    children: BTreeMap<&'static str, Vec<&'static str>>,
    /// The single head.
    head: &'static str,
    /// Tables whose presence marks an unversioned legacy database.
    probe_tables: Vec<&'static str>,
}

impl MigrationEngine {
    /// Validates a revision history.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidHistory`] for duplicate ids, unknown
    /// or repeated parents, more than two parents, cycles, or anything other
    /// than exactly one head.
    pub fn new(revisions: Vec<Revision>) -> Result<Self, MigrationError> {
        if revisions.is_empty() {
            return Err(MigrationError::InvalidHistory("history has no revisions".to_string()));
        }
        let mut declared: BTreeMap<&'static str, usize> = BTreeMap::new();
        for (index, revision) in revisions.iter().enumerate() {
            if revision.id.trim().is_empty() {
                return Err(MigrationError::InvalidHistory("empty revision id".to_string()));
            }
            if declared.insert(revision.id, index).is_some() {
                return Err(MigrationError::InvalidHistory(format!(
                    "duplicate revision id {}",
                    revision.id
                )));
            }
        }
        let mut children: BTreeMap<&'static str, Vec<&'static str>> =
            revisions.iter().map(|revision| (revision.id, Vec::new())).collect();
        for revision in &revisions {
            if revision.parents.len() > MAX_PARENTS {
                return Err(MigrationError::InvalidHistory(format!(
                    "revision {} declares more than {MAX_PARENTS} parents",
                    revision.id
                )));
            }
            let unique: BTreeSet<&str> = revision.parents.iter().copied().collect();
            if unique.len() != revision.parents.len() {
                return Err(MigrationError::InvalidHistory(format!(
                    "revision {} repeats a parent",
                    revision.id
                )));
            }
            for parent in revision.parents {
                let Some(siblings) = children.get_mut(parent) else {
                    return Err(MigrationError::InvalidHistory(format!(
                        "revision {} names unknown parent {parent}",
                        revision.id
                    )));
                };
                siblings.push(revision.id);
            }
        }

        let order = topological_order(&revisions, &declared, &children)?;
        let sorted: Vec<Revision> = order.iter().map(|index| revisions[*index]).collect();
        let positions =
            sorted.iter().enumerate().map(|(index, revision)| (revision.id, index)).collect();

        let heads: Vec<&'static str> = sorted
            .iter()
            .filter(|revision| children.get(revision.id).is_none_or(Vec::is_empty))
            .map(|revision| revision.id)
            .collect();
        let [head] = heads.as_slice() else {
            return Err(MigrationError::InvalidHistory(format!(
                "expected exactly one head, found: {}",
                heads.join(", ")
            )));
        };
        let head = *head;
        Ok(Self {
            revisions: sorted,
            positions,
            children,
            head,
            probe_tables: Vec::new(),
        })
    }

    /// Sets the tables whose presence marks a legacy database.
    #[must_use]
    pub fn with_probe_tables(mut self, tables: &[&'static str]) -> Self {
        self.probe_tables = tables.to_vec();
        self
    }

    /// Returns the head revision id.
    #[must_use]
    pub const fn head(&self) -> &'static str {
        self.head
    }

    /// Returns the revisions in topological order.
    #[must_use]
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// Looks up a revision by id.
    #[must_use]
    pub fn revision(&self, id: &str) -> Option<&Revision> {
        self.positions.get(id).map(|index| &self.revisions[*index])
    }

    /// Returns the revision and its ancestors.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::UnknownRevision`] for unknown ids.
    pub fn ancestors(&self, id: &str) -> Result<BTreeSet<&'static str>, MigrationError> {
        let start = self.resolve(id)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(revision) = self.revision(current) {
                stack.extend(revision.parents.iter().copied());
            }
        }
        Ok(seen)
    }

    /// Reads the recorded head set.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the marker cannot be read.
    pub fn current_heads(
        &self,
        target: &mut dyn MigrationTarget,
    ) -> Result<Vec<String>, MigrationError> {
        if !target.marker_exists()? {
            return Ok(Vec::new());
        }
        target.read_heads()
    }

    /// Returns the single recorded revision, or `None` for an unversioned
    /// database.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::MultipleHeads`] while branches are partly
    /// applied, or [`MigrationError`] when the marker cannot be read.
    pub fn current_revision(
        &self,
        target: &mut dyn MigrationTarget,
    ) -> Result<Option<String>, MigrationError> {
        let mut heads = self.current_heads(target)?;
        match heads.len() {
            0 => Ok(None),
            1 => Ok(heads.pop()),
            _ => Err(MigrationError::MultipleHeads(heads)),
        }
    }

    /// Classifies the database as fresh, legacy, or versioned.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when probing fails.
    pub fn detect_state(
        &self,
        target: &mut dyn MigrationTarget,
    ) -> Result<DatabaseState, MigrationError> {
        let heads = self.current_heads(target)?;
        if !heads.is_empty() {
            return Ok(DatabaseState::Versioned {
                heads,
            });
        }
        let mut tables = Vec::new();
        for table in &self.probe_tables {
            if target.table_exists(table)? {
                tables.push((*table).to_string());
            }
        }
        if tables.is_empty() {
            Ok(DatabaseState::Fresh)
        } else {
            Ok(DatabaseState::Legacy {
                tables,
            })
        }
    }

    /// Lists revisions an upgrade to `to` (default head) would execute.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] for unknown revisions or marker failures.
    pub fn pending(
        &self,
        target: &mut dyn MigrationTarget,
        to: Option<&str>,
    ) -> Result<Vec<&Revision>, MigrationError> {
        let destination = self.resolve(to.unwrap_or(self.head))?;
        let applied = self.applied_set(&self.current_heads(target)?)?;
        let wanted = self.ancestors(destination)?;
        Ok(self
            .revisions
            .iter()
            .filter(|revision| wanted.contains(revision.id) && !applied.contains(revision.id))
            .collect())
    }

    /// Upgrades the database to `to` (default: head).
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Step`] wrapping the first failing revision;
    /// the marker keeps every revision that committed before it.
    pub fn upgrade(
        &self,
        target: &mut dyn MigrationTarget,
        to: Option<&str>,
    ) -> Result<UpgradeReport, MigrationError> {
        let destination = self.resolve(to.unwrap_or(self.head))?;
        let starting_state = self.detect_state(target)?;
        match &starting_state {
            DatabaseState::Fresh => {
                info!(backend = target.backend_kind().as_str(), "initializing fresh database schema");
            }
            DatabaseState::Legacy {
                tables,
            } => {
                info!(
                    backend = target.backend_kind().as_str(),
                    tables = %tables.join(","),
                    "unversioned legacy database detected; replaying history idempotently"
                );
            }
            DatabaseState::Versioned {
                heads,
            } => {
                debug!(heads = %heads.join(","), "database schema is versioned");
            }
        }
        target.ensure_marker()?;
        let wanted = self.ancestors(destination)?;
        let applied = self.applied_set(&target.read_heads()?)?;
        let plan: Vec<&Revision> = self
            .revisions
            .iter()
            .filter(|revision| wanted.contains(revision.id) && !applied.contains(revision.id))
            .collect();

        let mut report = UpgradeReport {
            starting_state,
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        for revision in plan {
            let mut planner = |heads: &[String]| -> Result<Option<Vec<String>>, MigrationError> {
                let mut live = self.applied_set(heads)?;
                if live.contains(revision.id) {
                    return Ok(None);
                }
                for parent in revision.parents {
                    if !live.contains(parent) {
                        return Err(MigrationError::UnappliedParent {
                            revision: revision.id.to_string(),
                            parent: (*parent).to_string(),
                        });
                    }
                }
                live.insert(revision.id);
                Ok(Some(self.heads_of(&live)))
            };
            let executed = target.run_step(revision.upgrade, &mut planner).map_err(|source| {
                MigrationError::Step {
                    revision: revision.id.to_string(),
                    source: Box::new(source),
                }
            })?;
            if executed {
                info!(revision = revision.id, merge = revision.is_merge(), "applied schema revision");
                report.applied.push(revision.id.to_string());
            } else {
                debug!(revision = revision.id, "revision applied concurrently; skipped");
                report.skipped.push(revision.id.to_string());
            }
        }
        Ok(report)
    }

    /// Downgrades to `to`, or removes every revision when `to` is `None`.
    ///
    /// Irreversible revisions only move the marker. Returns the revisions
    /// removed from the marker, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Step`] wrapping the first failing revision.
    pub fn downgrade(
        &self,
        target: &mut dyn MigrationTarget,
        to: Option<&str>,
    ) -> Result<Vec<String>, MigrationError> {
        let keep = match to {
            Some(id) => self.ancestors(id)?,
            None => BTreeSet::new(),
        };
        if !target.marker_exists()? {
            return Ok(Vec::new());
        }
        let applied = self.applied_set(&target.read_heads()?)?;
        let removal: Vec<&Revision> = self
            .revisions
            .iter()
            .rev()
            .filter(|revision| applied.contains(revision.id) && !keep.contains(revision.id))
            .collect();
        let mut removed = Vec::new();
        for revision in removal {
            let step = match revision.downgrade {
                Downgrade::Steps(step) => step,
                Downgrade::Irreversible => {
                    info!(revision = revision.id, "revision is irreversible; downgrade moves marker only");
                    no_op
                }
            };
            let mut planner = |heads: &[String]| -> Result<Option<Vec<String>>, MigrationError> {
                let mut live = self.applied_set(heads)?;
                if !live.remove(revision.id) {
                    return Ok(None);
                }
                Ok(Some(self.heads_of(&live)))
            };
            let executed =
                target.run_step(step, &mut planner).map_err(|source| MigrationError::Step {
                    revision: revision.id.to_string(),
                    source: Box::new(source),
                })?;
            if executed {
                info!(revision = revision.id, "downgraded schema revision");
                removed.push(revision.id.to_string());
            }
        }
        Ok(removed)
    }

    /// Records `id` as the sole head without running any step.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] for unknown ids or marker failures.
    pub fn stamp(&self, target: &mut dyn MigrationTarget, id: &str) -> Result<(), MigrationError> {
        let id = self.resolve(id)?;
        target.ensure_marker()?;
        let mut planner = |_heads: &[String]| -> Result<Option<Vec<String>>, MigrationError> {
            Ok(Some(vec![id.to_string()]))
        };
        target.run_step(no_op, &mut planner)?;
        info!(revision = id, "stamped schema revision");
        Ok(())
    }

    /// Resolves an id to the history's static id.
    fn resolve(&self, id: &str) -> Result<&'static str, MigrationError> {
        self.revision(id)
            .map(|revision| revision.id)
            .ok_or_else(|| MigrationError::UnknownRevision(id.to_string()))
    }

    /// Returns every revision implied by a recorded head set.
    fn applied_set(&self, heads: &[String]) -> Result<BTreeSet<&'static str>, MigrationError> {
        let mut applied = BTreeSet::new();
        for head in heads {
            applied.extend(self.ancestors(head)?);
        }
        Ok(applied)
    }

    /// Returns the members of `set` with no child in `set`, in topological
    /// order.
    fn heads_of(&self, set: &BTreeSet<&'static str>) -> Vec<String> {
        self.revisions
            .iter()
            .filter(|revision| set.contains(revision.id))
            .filter(|revision| {
                self.children
                    .get(revision.id)
                    .is_none_or(|children| children.iter().all(|child| !set.contains(child)))
            })
            .map(|revision| revision.id.to_string())
            .collect()
    }
}

/// Kahn's algorithm, stable with respect to declaration order.
fn topological_order(
    revisions: &[Revision],
    declared: &BTreeMap<&'static str, usize>,
    children: &BTreeMap<&'static str, Vec<&'static str>>,
) -> Result<Vec<usize>, MigrationError> {
    let mut remaining: Vec<usize> = revisions.iter().map(|revision| revision.parents.len()).collect();
    let mut ready: VecDeque<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| index)
        .collect();
    let mut order = Vec::with_capacity(revisions.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        let mut unlocked = Vec::new();
        for child in children.get(revisions[index].id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(child_index) = declared.get(child).copied() {
                remaining[child_index] = remaining[child_index].saturating_sub(1);
                if remaining[child_index] == 0 {
                    unlocked.push(child_index);
                }
            }
        }
        unlocked.sort_unstable();
        ready.extend(unlocked);
    }
    if order.len() != revisions.len() {
        return Err(MigrationError::InvalidHistory("revision history contains a cycle".to_string()));
    }
    Ok(order)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
