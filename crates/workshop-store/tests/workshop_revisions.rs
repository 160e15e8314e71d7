// crates/workshop-store/tests/workshop_revisions.rs
// ============================================================================
// Module: Workshop Schema Convergence Tests
// Description: Fresh and hand-patched databases reach the same schema.
// Purpose: Guard the workshop history's idempotence and data preservation.
// Dependencies: workshop-store, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Builds a fresh database and a legacy database that was patched by hand
//! before the migration history existed, upgrades both, and compares their
//! schema fingerprints.

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

use std::path::Path;

use common::fingerprint;
use common::sqlite_manager;
use common::with_target;
use rusqlite::Connection;
use tempfile::TempDir;
use workshop_store::DatabaseState;
use workshop_store::workshop_engine;
use workshop_store::revisions::RUBRIC_JUDGE_TYPE;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Schema as it looked on long-running deployments: created by the ORM at an
/// early version, then patched with ad hoc `ALTER TABLE` statements.
const LEGACY_SCHEMA: &str = "
CREATE TABLE users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    workshop_id TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE workshops (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    facilitator_id TEXT,
    current_phase TEXT NOT NULL DEFAULT 'intake',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
ALTER TABLE workshops ADD COLUMN discovery_started BOOLEAN DEFAULT FALSE;
CREATE TABLE traces (
    id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL REFERENCES workshops(id),
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
ALTER TABLE traces ADD COLUMN context TEXT;
CREATE TABLE discovery_findings (
    id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    insight TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE rubrics (
    id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    question TEXT NOT NULL,
    created_by TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE annotations (
    id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    rating BIGINT NOT NULL,
    comment TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE user_trace_orders (
    id TEXT PRIMARY KEY,
    workshop_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    discovery_traces TEXT,
    annotation_traces TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
INSERT INTO workshops (id, name) VALUES ('w1', 'Support bot review');
INSERT INTO traces (id, workshop_id, input, output) VALUES ('t1', 'w1', 'hi', 'hello');
INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment)
    VALUES ('a1', 'w1', 't1', 'u1', 2, 'first pass');
INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment)
    VALUES ('a2', 'w1', 't1', 'u1', 4, 'second pass');
INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment)
    VALUES ('a3', 'w1', 't1', 'u2', 5, 'other user');
";

/// Writes the legacy fixture to `path`.
fn write_legacy(path: &Path) {
    let connection = Connection::open(path).unwrap();
    connection.execute_batch(LEGACY_SCHEMA).unwrap();
}

/// Upgrades the database at `path` to head.
fn upgrade(path: &Path) -> workshop_store::UpgradeReport {
    let manager = sqlite_manager(path);
    let engine = workshop_engine().unwrap();
    let report = with_target(&manager, |target| engine.upgrade(target, None)).unwrap();
    let current = with_target(&manager, |target| engine.current_revision(target)).unwrap();
    assert_eq!(current.as_deref(), Some(RUBRIC_JUDGE_TYPE));
    manager.dispose();
    report
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn fresh_and_legacy_databases_converge() {
    let dir = TempDir::new().unwrap();
    let fresh = dir.path().join("fresh.db");
    let legacy = dir.path().join("legacy.db");
    write_legacy(&legacy);

    let fresh_report = upgrade(&fresh);
    let legacy_report = upgrade(&legacy);
    assert_eq!(fresh_report.starting_state, DatabaseState::Fresh);
    assert!(matches!(legacy_report.starting_state, DatabaseState::Legacy { .. }));

    let fresh_print = fingerprint(&fresh);
    assert!(fresh_print.tables.contains_key("user_trace_orders"));
    assert!(fresh_print.indexes.contains_key("uq_annotations_user_trace"));
    let comment = &fresh_print.tables["annotations"]["comment"];
    assert!(!comment.1, "comment must be nullable after upgrade");
    assert_eq!(fresh_print, fingerprint(&legacy));
}

#[test]
fn legacy_rows_survive_dedupe_and_rebuild() {
    let dir = TempDir::new().unwrap();
    let legacy = dir.path().join("legacy.db");
    write_legacy(&legacy);
    upgrade(&legacy);

    let connection = Connection::open(&legacy).unwrap();
    let mut statement = connection
        .prepare("SELECT id, user_id, rating, comment FROM annotations ORDER BY id")
        .unwrap();
    let rows: Vec<(String, String, i64, Option<String>)> = statement
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            ("a2".to_string(), "u1".to_string(), 4, Some("second pass".to_string())),
            ("a3".to_string(), "u2".to_string(), 5, Some("other user".to_string())),
        ]
    );
    let context: Option<String> = connection
        .query_row("SELECT context FROM traces WHERE id = 't1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(context, None);
}

#[test]
fn dedupe_keeps_the_latest_annotation() {
    let dir = TempDir::new().unwrap();
    let legacy = dir.path().join("legacy.db");
    write_legacy(&legacy);
    {
        let connection = Connection::open(&legacy).unwrap();
        connection
            .execute_batch(
                "INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment, \
                 created_at) VALUES ('z-old', 'w1', 't1', 'u3', 1, 'draft', '2024-01-01 09:00:00');
                 INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment, \
                 created_at) VALUES ('b-new', 'w1', 't1', 'u3', 5, 'final', '2024-03-01 09:00:00');",
            )
            .unwrap();
    }
    upgrade(&legacy);

    let connection = Connection::open(&legacy).unwrap();
    let kept: Vec<(String, i64)> = connection
        .prepare("SELECT id, rating FROM annotations WHERE user_id = 'u3'")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(kept, vec![("b-new".to_string(), 5)]);
}

#[test]
fn rebuild_keeps_hand_added_columns() {
    let dir = TempDir::new().unwrap();
    let legacy = dir.path().join("legacy.db");
    write_legacy(&legacy);
    {
        let connection = Connection::open(&legacy).unwrap();
        connection
            .execute_batch(
                "ALTER TABLE annotations ADD COLUMN reviewer_note TEXT;
                 ALTER TABLE annotations ADD COLUMN reviewed INTEGER NOT NULL DEFAULT 0;
                 UPDATE annotations SET reviewer_note = 'checked', reviewed = 1 WHERE id = 'a3';",
            )
            .unwrap();
    }
    upgrade(&legacy);

    let connection = Connection::open(&legacy).unwrap();
    let (note, reviewed): (Option<String>, i64) = connection
        .query_row(
            "SELECT reviewer_note, reviewed FROM annotations WHERE id = 'a3'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(note.as_deref(), Some("checked"));
    assert_eq!(reviewed, 1);
    let print = fingerprint(&legacy);
    let comment = &print.tables["annotations"]["comment"];
    assert!(!comment.1, "comment must be nullable after upgrade");
    connection
        .execute_batch(
            "INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating) VALUES ('n2', \
             'w1', 't1', 'u9', 3);",
        )
        .unwrap();
    let default_reviewed: i64 = connection
        .query_row("SELECT reviewed FROM annotations WHERE id = 'n2'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(default_reviewed, 0);
}

#[test]
fn rerun_after_marker_loss_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workshop.db");
    upgrade(&path);
    let before = fingerprint(&path);

    {
        let connection = Connection::open(&path).unwrap();
        connection.execute_batch("DROP TABLE schema_revision;").unwrap();
    }
    let report = upgrade(&path);
    assert!(matches!(report.starting_state, DatabaseState::Legacy { .. }));
    assert_eq!(before, fingerprint(&path));
}

#[test]
fn upgraded_schema_accepts_null_comments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workshop.db");
    upgrade(&path);
    let connection = Connection::open(&path).unwrap();
    connection
        .execute_batch(
            "INSERT INTO annotations (id, workshop_id, trace_id, user_id, rating, comment) VALUES \
             ('n1', 'w1', 't1', 'u1', 3, NULL);",
        )
        .unwrap();
    connection
        .execute_batch("INSERT INTO rubrics (id, workshop_id, question) VALUES ('r1', 'w1', 'Helpful?');")
        .unwrap();
    let judge_type: String = connection
        .query_row("SELECT judge_type FROM rubrics WHERE id = 'r1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(judge_type, "likert");
}
