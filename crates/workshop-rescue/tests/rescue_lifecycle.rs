// crates/workshop-rescue/tests/rescue_lifecycle.rs
// ============================================================================
// Module: Rescue Lifecycle Tests
// Description: Restore, snapshot, timer, and shutdown flows.
// Purpose: Prove snapshots round-trip, restore never clobbers, and failures
//          never stop future snapshots.
// Dependencies: workshop-rescue, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Runs the rescue manager against a local directory standing in for the
//! remote volume, with injected upload and download failures.

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
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::Fixture;
use common::REMOTE;
use common::count_notes;
use common::insert_notes;
use common::pin_reader;
use common::seed_database;
use common::wait_until;
use workshop_rescue::RescueError;
use workshop_rescue::RescueManager;
use workshop_rescue::RescueSettings;
use workshop_rescue::RescueState;
use workshop_rescue::VolumeError;
use workshop_rescue::install_signal_handlers;

// ============================================================================
// SECTION: Restore and Snapshot
// ============================================================================

#[test]
fn snapshot_then_restore_round_trips_bytes() {
    let fixture = Fixture::new();
    let local = fixture.local_path();
    let writer = seed_database(&local, 25);

    let manager = fixture.manager(fixture.settings());
    manager.mark_ready();
    assert!(manager.snapshot(false));
    drop(writer);
    let before = fs::read(&local).unwrap();
    assert_eq!(fs::read(fixture.stored_snapshot()).unwrap(), before);

    fs::remove_file(&local).unwrap();
    let _ = fs::remove_file(local.with_extension("db-wal"));
    let _ = fs::remove_file(local.with_extension("db-shm"));

    let restarted = fixture.manager(fixture.settings());
    assert_eq!(restarted.state(), RescueState::Cold);
    assert!(restarted.restore());
    assert_eq!(restarted.state(), RescueState::Ready);
    assert_eq!(fs::read(&local).unwrap(), before);
    assert_eq!(count_notes(&local), 25);
}

#[test]
fn restore_refuses_to_overwrite_existing_file() {
    let fixture = Fixture::new();
    let local = fixture.local_path();
    fs::create_dir_all(local.parent().unwrap()).unwrap();
    fs::write(&local, b"already here").unwrap();
    let stored = fixture.stored_snapshot();
    fs::create_dir_all(stored.parent().unwrap()).unwrap();
    fs::write(&stored, b"remote copy").unwrap();

    let manager = fixture.manager(fixture.settings());
    assert!(!manager.restore());
    assert_eq!(fs::read(&local).unwrap(), b"already here");
    assert_eq!(fixture.volume.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(manager.state(), RescueState::Ready);
}

#[test]
fn missing_remote_snapshot_starts_fresh() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.settings());
    assert!(!manager.restore());
    assert!(!fixture.local_path().exists());
    assert_eq!(manager.state(), RescueState::Ready);
    assert!(!manager.restore(), "restore only runs from the cold state");
    assert_eq!(fixture.volume.downloads.load(Ordering::SeqCst), 1);
}

#[test]
fn transport_failure_during_restore_is_not_fatal() {
    let fixture = Fixture::new();
    fixture.volume.fail_downloads(VolumeError::Auth("token expired".to_string()));
    let manager = fixture.manager(fixture.settings());
    assert!(!manager.restore());
    assert!(!fixture.local_path().exists());
    assert_eq!(manager.state(), RescueState::Ready);
}

#[test]
fn unconfigured_manager_is_a_no_op() {
    let fixture = Fixture::new();
    let manager = Arc::new(RescueManager::new(
        RescueSettings::new(None, fixture.local_path()),
        None,
    ));
    assert_eq!(manager.state(), RescueState::Unconfigured);
    assert!(!manager.restore());
    assert!(!manager.snapshot(true));
    assert!(!manager.start_periodic().unwrap());
    assert_eq!(install_signal_handlers(&manager, |_| {}), Ok(false));
    assert!(!manager.status().configured);
}

#[test]
fn invalid_remote_path_is_refused_without_calls() {
    let fixture = Fixture::new();
    let settings = RescueSettings::new(Some("/Volumes/main/short".to_string()), fixture.local_path());
    let manager = fixture.manager(settings);
    seed_database(&fixture.local_path(), 1);

    assert!(!manager.snapshot(true));
    assert!(!manager.restore());
    assert!(matches!(
        install_signal_handlers(&manager, |_| {}),
        Err(RescueError::InvalidPath(_))
    ));
    let status = manager.status();
    assert!(status.remote_path_error.is_some());
    assert_eq!(status.remote_exists, None);
    assert_eq!(fixture.volume.total_calls(), 0);
}

// ============================================================================
// SECTION: WAL Sidecar
// ============================================================================

#[test]
fn clean_snapshot_clears_stale_wal_sidecar() {
    let fixture = Fixture::new();
    let local = fixture.local_path();
    let writer = seed_database(&local, 5);
    let settings = fixture.settings().with_checkpoint_busy_timeout(Duration::from_millis(50));
    let manager = fixture.manager(settings.clone());
    manager.mark_ready();

    let reader = pin_reader(&local);
    insert_notes(&writer, 5);
    assert!(manager.snapshot(true), "forced snapshot ships the pinned frames");
    assert!(fs::metadata(fixture.stored_wal()).unwrap().len() > 0);

    drop(reader);
    insert_notes(&writer, 5);
    assert!(manager.snapshot(false));
    assert!(!fixture.stored_wal().exists(), "a complete checkpoint leaves no remote wal");
    assert_eq!(count_notes(&local), 15);

    drop(writer);
    fixture.remove_local();
    let restarted = fixture.manager(settings);
    assert!(restarted.restore());
    assert_eq!(count_notes(&local), 15);
}

#[test]
fn periodic_snapshot_defers_while_reader_pins_frames() {
    let fixture = Fixture::new();
    let local = fixture.local_path();
    let writer = seed_database(&local, 5);
    let settings = fixture.settings().with_checkpoint_busy_timeout(Duration::from_millis(50));
    let manager = fixture.manager(settings.clone());
    manager.mark_ready();
    assert!(manager.snapshot(false));
    let first = fs::read(fixture.stored_snapshot()).unwrap();

    let reader = pin_reader(&local);
    insert_notes(&writer, 5);
    assert!(!manager.snapshot(false));
    assert_eq!(fs::read(fixture.stored_snapshot()).unwrap(), first);
    assert!(!fixture.stored_wal().exists());
    assert!(!manager.status().last_snapshot.unwrap().succeeded);

    assert!(manager.snapshot(true));
    assert!(fixture.stored_wal().is_file());

    drop(reader);
    drop(writer);
    fixture.remove_local();
    let restarted = fixture.manager(settings);
    assert!(restarted.restore());
    assert_eq!(count_notes(&local), 10);
}

// ============================================================================
// SECTION: Single Flight
// ============================================================================

#[test]
fn periodic_snapshot_skips_while_another_is_in_flight() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 3));
    let manager = fixture.manager(fixture.settings());
    manager.mark_ready();

    let release = fixture.volume.hold_next_upload();
    let background = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.snapshot(false))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        fixture.volume.uploads.load(Ordering::SeqCst) == 1
    }));
    assert!(manager.snapshot_in_flight());
    assert_eq!(manager.state(), RescueState::Snapshotting);

    assert!(!manager.snapshot(false));
    assert_eq!(fixture.volume.uploads.load(Ordering::SeqCst), 1);

    release.send(()).unwrap();
    assert!(background.join().unwrap());
    assert_eq!(manager.state(), RescueState::Ready);
}

#[test]
fn forced_snapshot_proceeds_after_bounded_wait() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 3));
    let manager = fixture.manager(fixture.settings());
    manager.mark_ready();

    let release = fixture.volume.hold_next_upload();
    let background = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.snapshot(false))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        fixture.volume.uploads.load(Ordering::SeqCst) == 1
    }));
    assert!(manager.snapshot_in_flight());

    assert!(manager.snapshot(true));
    let last = manager.status().last_snapshot.unwrap();
    assert!(last.forced && last.succeeded);

    release.send(()).unwrap();
    assert!(background.join().unwrap());
}

// ============================================================================
// SECTION: Timer and Shutdown
// ============================================================================

#[test]
fn periodic_timer_survives_failed_snapshot() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 2));
    fixture.volume.fail_next_uploads(1);
    let settings = fixture.settings().with_interval(Duration::from_millis(20));
    let manager = fixture.manager(settings);
    manager.mark_ready();

    assert!(manager.start_periodic().unwrap());
    assert!(!manager.start_periodic().unwrap(), "second installation is a no-op");
    assert!(wait_until(Duration::from_secs(10), || {
        fixture.volume.uploaded.load(Ordering::SeqCst) >= 1
    }));
    assert!(fixture.volume.uploads.load(Ordering::SeqCst) >= 2);
    assert!(manager.status().timer_running);

    manager.stop_timer();
    assert!(!manager.timer_running());
}

#[test]
fn stopped_timer_takes_no_further_snapshots() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 2));
    let settings = fixture.settings().with_interval(Duration::from_millis(20));
    let manager = fixture.manager(settings);
    manager.mark_ready();

    assert!(manager.start_periodic().unwrap());
    assert!(wait_until(Duration::from_secs(10), || {
        fixture.volume.uploads.load(Ordering::SeqCst) >= 1
    }));
    manager.stop_timer();
    let attempts = fixture.volume.uploads.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fixture.volume.uploads.load(Ordering::SeqCst), attempts);
    manager.stop_timer();
}

#[test]
fn shutdown_takes_one_final_snapshot() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 4));
    let settings = fixture.settings().with_interval_minutes(60);
    let manager = fixture.manager(settings);
    manager.mark_ready();
    assert!(manager.start_periodic().unwrap());

    assert!(manager.shutdown());
    assert_eq!(manager.state(), RescueState::Terminated);
    assert!(!manager.timer_running());
    assert!(fixture.stored_snapshot().is_file());
    assert!(!manager.shutdown(), "shutdown runs once");
    assert_eq!(fixture.volume.uploaded.load(Ordering::SeqCst), 1);
}

#[test]
fn status_serializes_for_health_checks() {
    let fixture = Fixture::new();
    drop(seed_database(&fixture.local_path(), 1));
    let manager = fixture.manager(fixture.settings());
    manager.mark_ready();
    assert!(manager.snapshot(false));

    let status = manager.status();
    assert!(status.configured);
    assert!(status.local_exists);
    assert_eq!(status.remote_exists, Some(true));
    assert_eq!(status.remote_path.as_deref(), Some(REMOTE));
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "ready");
    assert_eq!(json["snapshot_interval_secs"], 600);
    assert_eq!(json["last_snapshot"]["succeeded"], true);
}
