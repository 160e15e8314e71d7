// crates/workshop-cli/tests/lifecycle.rs
// ============================================================================
// Module: Lifecycle Tests
// Description: Startup and shutdown ordering against a mounted volume.
// Purpose: Prove restore runs before migration, a failed migration aborts
//          startup, and shutdown leaves a restorable snapshot.
// Dependencies: workshop-cli, workshop-config, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Each test runs the real startup sequence with a local directory as the
//! snapshot volume, then inspects the files it leaves behind.

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

use std::fs;

use common::Scratch;
use common::annotation;
use common::count_annotations;
use common::remove_database;
use workshop_cli::lifecycle::LifecycleError;
use workshop_cli::lifecycle::WorkshopRuntime;
use workshop_rescue::RescueState;
use workshop_store::BackendKind;
use workshop_store::DatabaseState;
use workshop_store::TransactionMode;

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn startup_upgrades_a_fresh_database() {
    let scratch = Scratch::new();
    let runtime = WorkshopRuntime::on_startup(&scratch.config()).unwrap();

    assert_eq!(runtime.sessions().kind(), BackendKind::EmbeddedFile);
    assert_eq!(runtime.rescue().state(), RescueState::Ready);
    let state = runtime
        .sessions()
        .with_migration_target(|target| runtime.engine().detect_state(target))
        .unwrap();
    assert_eq!(
        state,
        DatabaseState::Versioned {
            heads: vec![runtime.engine().head().to_string()],
        }
    );
    assert!(!runtime.rescue().timer_running(), "interval 0 disables the timer");
    runtime.on_shutdown();
}

#[test]
fn shutdown_snapshot_survives_container_recycle() {
    let scratch = Scratch::new();
    let first = WorkshopRuntime::on_startup(&scratch.config()).unwrap();
    first.upsert_annotation(&annotation("alice", 4)).unwrap();
    first.upsert_annotation(&annotation("bob", 2)).unwrap();
    assert!(first.on_shutdown());
    assert_eq!(first.rescue().state(), RescueState::Terminated);
    assert!(scratch.stored_snapshot().is_file());

    remove_database(&scratch.database_path());

    let second = WorkshopRuntime::on_startup(&scratch.config()).unwrap();
    assert_eq!(count_annotations(&scratch.database_path()), 2);
    let id = second.upsert_annotation(&annotation("alice", 5)).unwrap();
    assert!(!id.is_empty());
    assert_eq!(count_annotations(&scratch.database_path()), 2);
    second.on_shutdown();
}

#[test]
fn existing_local_database_is_not_overwritten() {
    let scratch = Scratch::new();
    let first = WorkshopRuntime::on_startup(&scratch.config()).unwrap();
    first.upsert_annotation(&annotation("alice", 4)).unwrap();
    assert!(first.on_shutdown());

    let newer = WorkshopRuntime::on_startup(&scratch.config_without_rescue()).unwrap();
    newer.upsert_annotation(&annotation("carol", 3)).unwrap();
    newer.on_shutdown();

    let restarted = WorkshopRuntime::on_startup(&scratch.config()).unwrap();
    assert_eq!(count_annotations(&scratch.database_path()), 2);
    restarted.on_shutdown();
}

#[test]
fn failed_migration_aborts_startup() {
    let scratch = Scratch::new();
    let path = scratch.database_path();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let garbage = "not a sqlite database ".repeat(200);
    fs::write(&path, &garbage).unwrap();
    let mut config = scratch.config();
    config.database.pool.timeout_ms = 500;
    config.database.session_retry.backoff_ms = 10;

    let result = WorkshopRuntime::on_startup(&config);
    assert!(matches!(
        result,
        Err(LifecycleError::Migration(_) | LifecycleError::Session(_))
    ));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        garbage,
        "restore never clobbers an existing file"
    );
}

#[test]
fn unconfigured_snapshots_do_not_block_startup() {
    let scratch = Scratch::new();
    let runtime = WorkshopRuntime::on_startup(&scratch.config_without_rescue()).unwrap();
    assert_eq!(runtime.rescue().state(), RescueState::Unconfigured);
    assert!(!runtime.rescue().status().configured);
    assert!(!runtime.on_shutdown());
    assert!(!scratch.stored_snapshot().exists());
}

#[test]
fn malformed_snapshot_path_is_logged_not_fatal() {
    let scratch = Scratch::new();
    let mut config = scratch.config();
    config.rescue.backup_path = Some("/Volumes/main/short".to_string());
    let runtime = WorkshopRuntime::on_startup(&config).unwrap();
    assert!(runtime.rescue().status().remote_path_error.is_some());
    assert!(!runtime.on_shutdown());
    assert!(!scratch.volume_root().exists());
}

#[test]
fn sessions_roll_back_uncommitted_work() {
    let scratch = Scratch::new();
    let runtime = WorkshopRuntime::on_startup(&scratch.config_without_rescue()).unwrap();
    {
        let mut session = runtime.sessions().acquire_session().unwrap();
        session.begin(TransactionMode::Immediate).unwrap();
        assert!(session.in_transaction());
        session.upsert(&annotation("dave", 1).to_upsert()).unwrap();
        session.rollback().unwrap();
    }
    assert_eq!(count_annotations(&scratch.database_path()), 0);
    runtime.on_shutdown();
}
