// crates/workshop-cli/tests/common/mod.rs
// =============================================================================
// Module: Lifecycle Test Helpers
// Description: Scratch configs with a mounted-directory volume.
// Purpose: Run the full startup and shutdown sequence without a network.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only helpers.")]

use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use tempfile::TempDir;
use workshop_config::WorkshopConfig;
use workshop_store::AnnotationUpsert;

/// Remote snapshot location used by the suites.
pub const REMOTE: &str = "/Volumes/main/workshop/backups/workshop.db";

/// Scratch directory holding the database and the volume root.
pub struct Scratch {
    /// Owns the directory.
    pub dir: TempDir,
}

impl Scratch {
    /// Creates the scratch directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Local database path.
    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("data").join("workshop.db")
    }

    /// Directory standing in for `/Volumes`.
    pub fn volume_root(&self) -> PathBuf {
        self.dir.path().join("volume")
    }

    /// Where the snapshot lands inside the volume root.
    pub fn stored_snapshot(&self) -> PathBuf {
        self.volume_root().join("main/workshop/backups/workshop.db")
    }

    /// Config with snapshots to the mounted volume and the timer disabled.
    pub fn config(&self) -> WorkshopConfig {
        let mut config = self.config_without_rescue();
        config.rescue.backup_path = Some(REMOTE.to_string());
        config.rescue.local_volume_root = Some(self.volume_root());
        config.rescue.interval_minutes = 0;
        config.rescue.forced_wait_secs = 1;
        config
    }

    /// Config with snapshots disabled.
    pub fn config_without_rescue(&self) -> WorkshopConfig {
        let mut config = WorkshopConfig::default();
        config.database.url = format!("sqlite:///{}", self.database_path().display());
        config.database.pool.pool_size = 2;
        config.database.pool.max_overflow = 2;
        config.validate().unwrap();
        config
    }
}

/// Builds an annotation for `user_id`.
pub fn annotation(user_id: &str, rating: i64) -> AnnotationUpsert {
    AnnotationUpsert {
        workshop_id: "w1".to_string(),
        trace_id: "t1".to_string(),
        user_id: user_id.to_string(),
        rating,
        ratings: None,
        comment: Some(format!("rated by {user_id}")),
    }
}

/// Counts annotation rows in the database at `path`.
pub fn count_annotations(path: &Path) -> i64 {
    let connection = Connection::open(path).unwrap();
    connection.query_row("SELECT COUNT(*) FROM annotations", [], |row| row.get(0)).unwrap()
}

/// Removes the database file and its sidecars.
pub fn remove_database(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(target));
    }
}
