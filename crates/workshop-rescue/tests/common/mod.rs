// crates/workshop-rescue/tests/common/mod.rs
// =============================================================================
// Module: Rescue Test Helpers
// Description: Scripted volume client and database fixtures.
// Purpose: Drive rescue flows without a network.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only helpers.")]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rusqlite::Connection;
use tempfile::TempDir;
use workshop_rescue::LocalVolumeClient;
use workshop_rescue::RescueManager;
use workshop_rescue::RescueSettings;
use workshop_rescue::VolumeClient;
use workshop_rescue::VolumeError;
use workshop_rescue::VolumePath;

/// Remote path used by the suites.
pub const REMOTE: &str = "/Volumes/main/workshop/backups/workshop.db";

/// Local volume wrapper with call counters and injectable failures.
pub struct ScriptedVolume {
    /// Real storage.
    inner: LocalVolumeClient,
    /// Upload attempts.
    pub uploads: AtomicUsize,
    /// Successful uploads.
    pub uploaded: AtomicUsize,
    /// Download attempts.
    pub downloads: AtomicUsize,
    /// Existence checks.
    pub exists_calls: AtomicUsize,
    /// Remove calls.
    pub removes: AtomicUsize,
    /// Upload failures still to inject.
    fail_uploads: AtomicUsize,
    /// Error returned by every download when set.
    download_error: Mutex<Option<VolumeError>>,
    /// Blocks the next upload until a message arrives.
    hold: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ScriptedVolume {
    /// Creates a client rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalVolumeClient::new(root),
            uploads: AtomicUsize::new(0),
            uploaded: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            fail_uploads: AtomicUsize::new(0),
            download_error: Mutex::new(None),
            hold: Mutex::new(None),
        }
    }

    /// Fails the next `count` uploads.
    pub fn fail_next_uploads(&self, count: usize) {
        self.fail_uploads.store(count, Ordering::SeqCst);
    }

    /// Fails every download with `error`.
    pub fn fail_downloads(&self, error: VolumeError) {
        *self.download_error.lock().unwrap() = Some(error);
    }

    /// Blocks the next upload until the returned sender fires.
    pub fn hold_next_upload(&self) -> mpsc::Sender<()> {
        let (release, held) = mpsc::channel();
        *self.hold.lock().unwrap() = Some(held);
        release
    }

    /// Total calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
            + self.downloads.load(Ordering::SeqCst)
            + self.exists_calls.load(Ordering::SeqCst)
            + self.removes.load(Ordering::SeqCst)
    }

    /// Local location of a remote path.
    pub fn resolve(&self, remote: &VolumePath) -> PathBuf {
        self.inner.resolve(remote)
    }
}

impl VolumeClient for ScriptedVolume {
    fn download(&self, remote: &VolumePath, local: &Path) -> Result<u64, VolumeError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.download_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.inner.download(remote, local)
    }

    fn upload(&self, local: &Path, remote: &VolumePath) -> Result<u64, VolumeError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let held = self.hold.lock().unwrap().take();
        if let Some(held) = held {
            let _ = held.recv_timeout(Duration::from_secs(10));
        }
        let remaining = self.fail_uploads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_uploads.store(remaining - 1, Ordering::SeqCst);
            return Err(VolumeError::Transport("injected upload failure".to_string()));
        }
        let bytes = self.inner.upload(local, remote)?;
        self.uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(bytes)
    }

    fn exists(&self, remote: &VolumePath) -> Result<bool, VolumeError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(remote)
    }

    fn remove(&self, remote: &VolumePath) -> Result<(), VolumeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(remote)
    }
}

/// Scratch layout: a local data dir and a volume root.
pub struct Fixture {
    /// Owns the scratch directory.
    pub dir: TempDir,
    /// Scripted storage.
    pub volume: Arc<ScriptedVolume>,
}

impl Fixture {
    /// Creates the scratch layout.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(ScriptedVolume::new(&dir.path().join("volume")));
        Self {
            dir,
            volume,
        }
    }

    /// Local database path.
    pub fn local_path(&self) -> PathBuf {
        self.dir.path().join("data").join("workshop.db")
    }

    /// Settings pointing at [`REMOTE`].
    pub fn settings(&self) -> RescueSettings {
        RescueSettings::new(Some(REMOTE.to_string()), self.local_path())
            .with_forced_wait(Duration::from_millis(200))
    }

    /// Manager over the scripted volume.
    pub fn manager(&self, settings: RescueSettings) -> Arc<RescueManager> {
        let client: Arc<dyn VolumeClient> = self.volume.clone();
        Arc::new(RescueManager::new(settings, Some(client)))
    }

    /// Location of the stored snapshot.
    pub fn stored_snapshot(&self) -> PathBuf {
        self.volume.resolve(&VolumePath::parse(REMOTE).unwrap())
    }

    /// Location of the stored WAL sidecar.
    pub fn stored_wal(&self) -> PathBuf {
        self.volume.resolve(&VolumePath::parse(REMOTE).unwrap().wal_path())
    }

    /// Deletes the local database and its sidecars.
    pub fn remove_local(&self) {
        let local = self.local_path();
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = local.clone().into_os_string();
            raw.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(raw));
        }
    }
}

/// Creates a WAL-mode database with `rows` notes and returns the open
/// connection so WAL frames stay pending.
pub fn seed_database(path: &Path, rows: usize) -> Connection {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let connection = Connection::open(path).unwrap();
    connection
        .query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
        .unwrap();
    connection
        .execute_batch("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);")
        .unwrap();
    for index in 0 .. rows {
        connection
            .execute("INSERT INTO notes (body) VALUES (?1)", [format!("note {index}")])
            .unwrap();
    }
    connection
}

/// Appends `rows` notes through an existing connection.
pub fn insert_notes(connection: &Connection, rows: usize) {
    for index in 0 .. rows {
        connection
            .execute("INSERT INTO notes (body) VALUES (?1)", [format!("extra {index}")])
            .unwrap();
    }
}

/// Opens a reader holding a read transaction, pinning current WAL frames.
pub fn pin_reader(path: &Path) -> Connection {
    let reader = Connection::open(path).unwrap();
    reader.execute_batch("BEGIN DEFERRED;").unwrap();
    let _: i64 = reader.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0)).unwrap();
    reader
}

/// Counts notes in the database at `path`.
pub fn count_notes(path: &Path) -> i64 {
    let connection = Connection::open(path).unwrap();
    connection.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0)).unwrap()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
