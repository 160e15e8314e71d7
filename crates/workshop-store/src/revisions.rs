// crates/workshop-store/src/revisions.rs
// ============================================================================
// Module: Workshop Schema History
// Description: The annotation workshop's schema revisions.
// Purpose: Define the canonical schema as an ordered, idempotent history that
//          fresh and hand-patched databases both converge on.
// Dependencies: crate::migrate
// ============================================================================

//! ## Overview
//! The history branches after the unique-annotation revision: the judge
//! tuning work and the discovery randomization work landed in parallel and
//! both introduced `user_trace_orders`. Each branch creates that table only
//! when missing, and the merge revision converges them without further DDL.
//!
//! ```text
//! initial -> trace_context -> annotation_unique_key -+-> judge_prompts -> judge_eval_reasoning -+
//!                                                     +-> discovery_randomization -------------+
//!   -> merge_judge_discovery -> annotation_comment_optional -> workshop_phase_flags
//!   -> rubric_judge_type
//! ```
//!
//! Every step checks live state before changing it. Databases that predate
//! the history often received some of these columns through ad hoc
//! `ALTER TABLE` statements, so a blind `ADD COLUMN` would fail there.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::backend::BackendKind;
use crate::migrate::MigrationEngine;
use crate::migrate::MigrationError;
use crate::migrate::Revision;
use crate::migrate::SchemaOps;
use crate::migrate::TableRebuild;
use crate::migrate::add_column_if_missing;
use crate::migrate::column_nullable;
use crate::migrate::create_index_if_missing;
use crate::migrate::create_table_if_missing;
use crate::migrate::drop_index_if_exists;
use crate::migrate::no_op;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Initial schema.
pub const INITIAL: &str = "20240105_initial";
/// Trace context columns.
pub const TRACE_CONTEXT: &str = "20240212_trace_context";
/// Unique `(user_id, trace_id)` on annotations.
pub const ANNOTATION_UNIQUE_KEY: &str = "20240301_annotation_unique_key";
/// Judge prompt tables (judge branch).
pub const JUDGE_PROMPTS: &str = "20240410_judge_prompts";
/// Judge evaluation reasoning (judge branch).
pub const JUDGE_EVAL_REASONING: &str = "20240422_judge_eval_reasoning";
/// Discovery randomization (discovery branch).
pub const DISCOVERY_RANDOMIZATION: &str = "20240415_discovery_randomization";
/// Merge of the judge and discovery branches.
pub const MERGE_JUDGE_DISCOVERY: &str = "20240501_merge_judge_discovery";
/// Nullable annotation comments and per-question ratings.
pub const ANNOTATION_COMMENT_OPTIONAL: &str = "20240520_annotation_comment_optional";
/// Workshop phase flags.
pub const WORKSHOP_PHASE_FLAGS: &str = "20240611_workshop_phase_flags";
/// Rubric judge type.
pub const RUBRIC_JUDGE_TYPE: &str = "20240702_rubric_judge_type";

/// Tables whose presence without a marker means a legacy database.
pub const PROBE_TABLES: [&str; 4] = ["workshops", "traces", "annotations", "users"];

/// Canonical annotations shape after the comment became optional.
const ANNOTATION_COLUMNS: [&str; 8] = [
    "id TEXT PRIMARY KEY",
    "workshop_id TEXT NOT NULL",
    "trace_id TEXT NOT NULL",
    "user_id TEXT NOT NULL",
    "rating BIGINT NOT NULL",
    "ratings TEXT",
    "comment TEXT",
    "created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
];

/// Deletes every annotation that has a newer duplicate (embedded file).
const DEDUPE_ANNOTATIONS_EMBEDDED: &str = "DELETE FROM annotations WHERE EXISTS (SELECT 1 FROM \
     annotations newer WHERE newer.user_id = annotations.user_id AND newer.trace_id = \
     annotations.trace_id AND (COALESCE(newer.created_at, '') > COALESCE(annotations.created_at, \
     '') OR (COALESCE(newer.created_at, '') = COALESCE(annotations.created_at, '') AND \
     newer.rowid > annotations.rowid)))";

/// Deletes every annotation that has a newer duplicate (server).
const DEDUPE_ANNOTATIONS_SERVER: &str = "DELETE FROM annotations WHERE EXISTS (SELECT 1 FROM \
     annotations newer WHERE newer.user_id = annotations.user_id AND newer.trace_id = \
     annotations.trace_id AND (COALESCE(newer.created_at, '-infinity') > \
     COALESCE(annotations.created_at, '-infinity') OR (COALESCE(newer.created_at, '-infinity') = \
     COALESCE(annotations.created_at, '-infinity') AND newer.ctid > annotations.ctid)))";

/// In-place equivalent of the annotations rebuild for servers.
const ANNOTATION_SERVER_STATEMENTS: [&str; 3] = [
    "ALTER TABLE annotations ALTER COLUMN comment DROP NOT NULL",
    "ALTER TABLE annotations ALTER COLUMN comment DROP DEFAULT",
    "ALTER TABLE annotations ADD COLUMN IF NOT EXISTS ratings TEXT",
];

// ============================================================================
// SECTION: History
// ============================================================================

/// Returns the workshop schema history.
#[must_use]
pub fn workshop_revisions() -> Vec<Revision> {
    vec![
        Revision::new(INITIAL, &[], "users, workshops, traces, findings, rubrics, annotations", initial_up)
            .with_downgrade(initial_down),
        Revision::new(TRACE_CONTEXT, &[INITIAL], "trace context and MLflow linkage", trace_context_up),
        Revision::new(
            ANNOTATION_UNIQUE_KEY,
            &[TRACE_CONTEXT],
            "one annotation per user and trace",
            annotation_unique_key_up,
        )
        .with_downgrade(annotation_unique_key_down),
        Revision::new(
            JUDGE_PROMPTS,
            &[ANNOTATION_UNIQUE_KEY],
            "judge prompts, evaluations, and trace orders",
            judge_prompts_up,
        )
        .with_downgrade(judge_prompts_down),
        Revision::new(
            JUDGE_EVAL_REASONING,
            &[JUDGE_PROMPTS],
            "judge confidence and reasoning",
            judge_eval_reasoning_up,
        ),
        Revision::new(
            DISCOVERY_RANDOMIZATION,
            &[ANNOTATION_UNIQUE_KEY],
            "per-user randomized discovery order",
            discovery_randomization_up,
        ),
        Revision::new(
            MERGE_JUDGE_DISCOVERY,
            &[JUDGE_EVAL_REASONING, DISCOVERY_RANDOMIZATION],
            "converge judge and discovery branches",
            no_op,
        )
        .with_downgrade(no_op),
        Revision::new(
            ANNOTATION_COMMENT_OPTIONAL,
            &[MERGE_JUDGE_DISCOVERY],
            "nullable annotation comment and per-question ratings",
            annotation_comment_optional_up,
        ),
        Revision::new(
            WORKSHOP_PHASE_FLAGS,
            &[ANNOTATION_COMMENT_OPTIONAL],
            "workshop phase flags and judge name",
            workshop_phase_flags_up,
        ),
        Revision::new(
            RUBRIC_JUDGE_TYPE,
            &[WORKSHOP_PHASE_FLAGS],
            "rubric judge type",
            rubric_judge_type_up,
        )
        .with_downgrade(rubric_judge_type_down),
    ]
}

/// Builds the engine over the workshop history.
///
/// # Errors
///
/// Returns [`MigrationError::InvalidHistory`] if the history is malformed.
pub fn workshop_engine() -> Result<MigrationEngine, MigrationError> {
    Ok(MigrationEngine::new(workshop_revisions())?.with_probe_tables(&PROBE_TABLES))
}

// ============================================================================
// SECTION: Steps
// ============================================================================

/// Creates the core tables.
fn initial_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    create_table_if_missing(
        ops,
        "users",
        "id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    workshop_id TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "workshops",
        "id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    facilitator_id TEXT,
    current_phase TEXT NOT NULL DEFAULT 'intake',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "traces",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL REFERENCES workshops(id),
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "discovery_findings",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    insight TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "rubrics",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    question TEXT NOT NULL,
    created_by TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "annotations",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    rating BIGINT NOT NULL,
    comment TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_index_if_missing(ops, "ix_traces_workshop_id", "traces", &["workshop_id"], false)?;
    create_index_if_missing(ops, "ix_annotations_trace_id", "annotations", &["trace_id"], false)?;
    Ok(())
}

/// Drops the core tables.
fn initial_down(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    for table in ["annotations", "rubrics", "discovery_findings", "traces", "workshops", "users"] {
        ops.execute(&format!("DROP TABLE IF EXISTS {table}"))?;
    }
    Ok(())
}

/// Adds trace context and MLflow linkage.
fn trace_context_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    add_column_if_missing(ops, "traces", "context", "TEXT")?;
    add_column_if_missing(ops, "traces", "mlflow_trace_id", "TEXT")?;
    add_column_if_missing(ops, "traces", "trace_metadata", "TEXT")?;
    create_index_if_missing(ops, "ix_traces_mlflow_trace_id", "traces", &["mlflow_trace_id"], false)?;
    Ok(())
}

/// Removes duplicate annotations, then enforces one per user and trace.
fn annotation_unique_key_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    if ops.index_exists("uq_annotations_user_trace")? {
        return Ok(());
    }
    // Keeps the latest row in each duplicate group; physical row order
    // breaks created_at ties.
    let dedupe = match ops.backend_kind() {
        BackendKind::EmbeddedFile => DEDUPE_ANNOTATIONS_EMBEDDED,
        BackendKind::RelationalServer => DEDUPE_ANNOTATIONS_SERVER,
    };
    ops.execute(dedupe)?;
    create_index_if_missing(
        ops,
        "uq_annotations_user_trace",
        "annotations",
        &["user_id", "trace_id"],
        true,
    )?;
    Ok(())
}

/// Drops the annotation uniqueness index.
fn annotation_unique_key_down(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    drop_index_if_exists(ops, "uq_annotations_user_trace")?;
    Ok(())
}

/// Creates `user_trace_orders`; shared by both branches.
fn ensure_user_trace_orders(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    create_table_if_missing(
        ops,
        "user_trace_orders",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    discovery_traces TEXT,
    annotation_traces TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_index_if_missing(
        ops,
        "uq_user_trace_orders_workshop_user",
        "user_trace_orders",
        &["workshop_id", "user_id"],
        true,
    )?;
    Ok(())
}

/// Creates judge prompt and evaluation tables.
fn judge_prompts_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    create_table_if_missing(
        ops,
        "judge_prompts",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    version BIGINT NOT NULL DEFAULT 1,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    create_table_if_missing(
        ops,
        "judge_evaluations",
        "id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    predicted_rating BIGINT,
    human_rating BIGINT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    )?;
    ensure_user_trace_orders(ops)
}

/// Drops the judge tables; `user_trace_orders` is shared and stays.
fn judge_prompts_down(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    ops.execute("DROP TABLE IF EXISTS judge_evaluations")?;
    ops.execute("DROP TABLE IF EXISTS judge_prompts")
}

/// Adds judge confidence and reasoning.
fn judge_eval_reasoning_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    add_column_if_missing(ops, "judge_evaluations", "confidence", "DOUBLE PRECISION")?;
    add_column_if_missing(ops, "judge_evaluations", "reasoning", "TEXT")?;
    Ok(())
}

/// Adds per-user discovery randomization.
fn discovery_randomization_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    add_column_if_missing(ops, "workshops", "discovery_randomize", "BOOLEAN DEFAULT FALSE")?;
    ensure_user_trace_orders(ops)
}

/// Makes annotation comments optional and adds per-question ratings.
fn annotation_comment_optional_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    if column_nullable(ops, "annotations", "comment")? == Some(false) {
        ops.rebuild_table(&TableRebuild {
            table: "annotations",
            columns: &ANNOTATION_COLUMNS,
            constraints: &[],
            server_statements: &ANNOTATION_SERVER_STATEMENTS,
        })?;
    }
    add_column_if_missing(ops, "annotations", "ratings", "TEXT")?;
    Ok(())
}

/// Adds workshop phase flags.
fn workshop_phase_flags_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    add_column_if_missing(ops, "workshops", "discovery_started", "BOOLEAN DEFAULT FALSE")?;
    add_column_if_missing(ops, "workshops", "annotation_started", "BOOLEAN DEFAULT FALSE")?;
    add_column_if_missing(ops, "workshops", "active_discovery_trace_ids", "TEXT")?;
    add_column_if_missing(ops, "workshops", "active_annotation_trace_ids", "TEXT")?;
    add_column_if_missing(ops, "workshops", "judge_name", "TEXT")?;
    Ok(())
}

/// Adds the rubric judge type.
fn rubric_judge_type_up(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    add_column_if_missing(ops, "rubrics", "judge_type", "TEXT NOT NULL DEFAULT 'likert'")?;
    create_index_if_missing(ops, "ix_rubrics_workshop_id", "rubrics", &["workshop_id"], false)?;
    Ok(())
}

/// Drops the rubric index; the column stays.
fn rubric_judge_type_down(ops: &mut dyn SchemaOps) -> Result<(), MigrationError> {
    drop_index_if_exists(ops, "ix_rubrics_workshop_id")?;
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
