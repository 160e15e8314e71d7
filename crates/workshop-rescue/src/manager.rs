// crates/workshop-rescue/src/manager.rs
// ============================================================================
// Module: Rescue Manager
// Description: Restore-on-start, periodic snapshot, and final snapshot of the
//              embedded database file.
// Purpose: Make an ephemeral local database durable across restarts by
//          copying it to and from a remote volume.
// Dependencies: rusqlite, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`RescueManager`] owns the lifecycle of one local database file:
//!
//! `Unconfigured` | `Cold` -> `Restoring` -> `Ready` <-> `Snapshotting`
//! -> `FinalSnapshot` -> `Terminated`
//!
//! Durability is best-effort. Every transfer failure is logged and reported
//! as `false`; nothing here aborts startup or shutdown.
//!
//! Invariants:
//! - Restore never overwrites an existing local file.
//! - Uploads only ever read a checkpointed file (`wal_checkpoint(TRUNCATE)`
//!   runs first). After a complete checkpoint the remote WAL sidecar is
//!   removed, so a restored snapshot needs no WAL replay.
//! - When readers pin WAL frames the checkpoint is partial. Periodic
//!   snapshots then defer; forced snapshots ship the main file together
//!   with its matching WAL.
//! - At most one snapshot uploads at a time; periodic snapshots skip when
//!   another is in flight, forced snapshots wait a bounded time and then
//!   proceed.
//! - The periodic timer keeps ticking after failed or panicking snapshots.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::path::VolumePath;
use crate::path::WAL_SUFFIX;
use crate::volume::VolumeClient;
use crate::volume::VolumeError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default periodic snapshot interval in minutes.
pub const DEFAULT_SNAPSHOT_INTERVAL_MINUTES: u64 = 10;
/// Default wait for an in-flight snapshot before a forced snapshot proceeds.
pub const DEFAULT_FORCED_WAIT: Duration = Duration::from_secs(30);
/// Default busy timeout for the checkpoint connection.
pub const DEFAULT_CHECKPOINT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on joining the timer thread after it was told to stop.
const TIMER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Name of the periodic snapshot thread.
const TIMER_THREAD_NAME: &str = "workshop-rescue-timer";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Rescue setup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RescueError {
    /// No remote path or volume client is configured.
    #[error("volume rescue is not configured")]
    NotConfigured,
    /// The configured remote path is structurally invalid.
    #[error("invalid remote snapshot path: {0}")]
    InvalidPath(String),
    /// A background thread or runtime could not be started.
    #[error("rescue runtime error: {0}")]
    Runtime(String),
}

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Rescue manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueSettings {
    /// Remote snapshot path; `None` disables the feature.
    pub remote_path: Option<String>,
    /// Local database file.
    pub local_path: PathBuf,
    /// Periodic snapshot interval; zero disables the timer.
    pub snapshot_interval: Duration,
    /// Bound on how long a forced snapshot waits for an in-flight one.
    pub forced_wait: Duration,
    /// Busy timeout applied while checkpointing before an upload.
    pub checkpoint_busy_timeout: Duration,
}

impl RescueSettings {
    /// Creates settings with the default interval and forced wait.
    #[must_use]
    pub fn new(remote_path: Option<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path,
            local_path: local_path.into(),
            snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_MINUTES * 60),
            forced_wait: DEFAULT_FORCED_WAIT,
            checkpoint_busy_timeout: DEFAULT_CHECKPOINT_BUSY_TIMEOUT,
        }
    }

    /// Sets the periodic interval in minutes; zero disables the timer.
    #[must_use]
    pub const fn with_interval_minutes(mut self, minutes: u64) -> Self {
        self.snapshot_interval = Duration::from_secs(minutes.saturating_mul(60));
        self
    }

    /// Sets the periodic interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the forced snapshot wait bound.
    #[must_use]
    pub const fn with_forced_wait(mut self, wait: Duration) -> Self {
        self.forced_wait = wait;
        self
    }

    /// Sets the checkpoint busy timeout.
    #[must_use]
    pub const fn with_checkpoint_busy_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint_busy_timeout = timeout;
        self
    }
}

// ============================================================================
// SECTION: State
// ============================================================================

/// Lifecycle state of the rescue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescueState {
    /// No remote path configured; every operation is a no-op.
    Unconfigured,
    /// Process start; the local file may or may not exist.
    Cold,
    /// One-shot download in progress.
    Restoring,
    /// Local file is authoritative.
    Ready,
    /// A snapshot upload is in progress.
    Snapshotting,
    /// The shutdown snapshot is in progress.
    FinalSnapshot,
    /// Shutdown finished.
    Terminated,
}

/// Outcome of the most recent snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    /// True when the main file uploaded.
    pub succeeded: bool,
    /// True for forced (shutdown or manual) snapshots.
    pub forced: bool,
    /// Completion time in milliseconds since the Unix epoch.
    pub finished_at_ms: u64,
    /// Bytes uploaded for the main file.
    pub bytes: Option<u64>,
}

/// Result of the pre-upload WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    /// Every frame was copied and the WAL truncated.
    Complete,
    /// Readers kept frames pinned; the main file alone is stale.
    Partial,
}

/// Health-check view of the rescue manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescueStatus {
    /// True when a remote path and client are configured.
    pub configured: bool,
    /// Current lifecycle state.
    pub state: RescueState,
    /// Configured remote path.
    pub remote_path: Option<String>,
    /// Why the remote path is invalid, if it is.
    pub remote_path_error: Option<String>,
    /// Local database file.
    pub local_path: String,
    /// True when the local file exists.
    pub local_exists: bool,
    /// True when the remote snapshot exists; `None` when unknown.
    pub remote_exists: Option<bool>,
    /// Periodic interval in seconds.
    pub snapshot_interval_secs: u64,
    /// True while the periodic timer runs.
    pub timer_running: bool,
    /// True when this manager owns the process signal hooks.
    pub handlers_installed: bool,
    /// Most recent snapshot attempt.
    pub last_snapshot: Option<SnapshotRecord>,
}

// ============================================================================
// SECTION: Snapshot Gate
// ============================================================================

/// Single-flight lock around snapshot uploads.
#[derive(Debug, Default)]
struct SnapshotGate {
    /// True while a snapshot holds the gate.
    busy: Mutex<bool>,
    /// Signalled when the gate is released.
    released: Condvar,
}

impl SnapshotGate {
    /// Takes the gate if it is free.
    fn try_acquire(&self) -> Option<GatePermit<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if *busy {
            return None;
        }
        *busy = true;
        Some(GatePermit {
            gate: self,
        })
    }

    /// Waits up to `timeout` for the gate.
    fn acquire_within(&self, timeout: Duration) -> Option<GatePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while *busy {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            busy = self
                .released
                .wait_timeout(busy, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *busy = true;
        Some(GatePermit {
            gate: self,
        })
    }

    /// Returns true while held.
    fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the gate on drop.
struct GatePermit<'a> {
    /// Held gate.
    gate: &'a SnapshotGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *self.gate.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.gate.released.notify_all();
    }
}

// ============================================================================
// SECTION: Timer
// ============================================================================

/// Running periodic timer.
struct TimerHandle {
    /// Stop signal; dropping it also stops the loop.
    stop: mpsc::Sender<()>,
    /// Timer thread.
    thread: thread::JoinHandle<()>,
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Volume durability manager for one local database file.
pub struct RescueManager {
    /// Settings.
    settings: RescueSettings,
    /// Storage client; `None` disables the feature.
    client: Option<Arc<dyn VolumeClient>>,
    /// Lifecycle state.
    state: Mutex<RescueState>,
    /// Upload single-flight gate.
    gate: SnapshotGate,
    /// Running timer, if any.
    timer: Mutex<Option<TimerHandle>>,
    /// Set once the timer was installed.
    timer_installed: AtomicBool,
    /// Set when this manager owns the process signal hooks.
    handlers_installed: AtomicBool,
    /// Set once shutdown began.
    shutdown_started: AtomicBool,
    /// Most recent snapshot attempt.
    last_snapshot: Mutex<Option<SnapshotRecord>>,
}

impl std::fmt::Debug for RescueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescueManager")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RescueManager {
    /// Creates a manager. Without a remote path or client it stays
    /// [`RescueState::Unconfigured`].
    #[must_use]
    pub fn new(settings: RescueSettings, client: Option<Arc<dyn VolumeClient>>) -> Self {
        let configured = settings.remote_path.is_some() && client.is_some();
        let state = if configured { RescueState::Cold } else { RescueState::Unconfigured };
        Self {
            settings,
            client,
            state: Mutex::new(state),
            gate: SnapshotGate::default(),
            timer: Mutex::new(None),
            timer_installed: AtomicBool::new(false),
            handlers_installed: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            last_snapshot: Mutex::new(None),
        }
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &RescueSettings {
        &self.settings
    }

    /// Returns true when a remote path and client are configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.settings.remote_path.is_some() && self.client.is_some()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> RescueState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the validated remote path.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::NotConfigured`] without a remote path, or
    /// [`RescueError::InvalidPath`] when it fails validation.
    pub fn remote_path(&self) -> Result<VolumePath, RescueError> {
        let raw = self.settings.remote_path.as_deref().ok_or(RescueError::NotConfigured)?;
        VolumePath::parse(raw).map_err(|err| RescueError::InvalidPath(err.to_string()))
    }

    /// Returns the local WAL sidecar path.
    fn local_wal_path(&self) -> PathBuf {
        let mut raw = self.settings.local_path.clone().into_os_string();
        raw.push(WAL_SUFFIX);
        PathBuf::from(raw)
    }

    /// Sets the lifecycle state.
    fn set_state(&self, next: RescueState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = ?*state, to = ?next, "rescue state change");
            *state = next;
        }
    }

    /// Moves `from` to `to` only when currently in `from`.
    fn transition(&self, from: RescueState, to: RescueState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------------

    /// Downloads the remote snapshot into an absent local file.
    ///
    /// Only acts in [`RescueState::Cold`]. Returns true when the main file was
    /// restored. A missing remote snapshot is the normal first-run outcome.
    pub fn restore(&self) -> bool {
        let Some(client) = self.client.as_deref() else {
            debug!("restore skipped: rescue not configured");
            return false;
        };
        let remote = match self.remote_path() {
            Ok(remote) => remote,
            Err(err) => {
                warn!(error = %err, "restore skipped");
                return false;
            }
        };
        if !self.transition(RescueState::Cold, RescueState::Restoring) {
            warn!(state = ?self.state(), "restore skipped: not in cold state");
            return false;
        }
        let local = self.settings.local_path.as_path();
        if local.exists() {
            info!(local = %local.display(), "local database exists; refusing to overwrite with snapshot");
            self.set_state(RescueState::Ready);
            return false;
        }
        let restored = match client.download(&remote, local) {
            Ok(bytes) => {
                info!(remote = %remote, bytes, "database restored from snapshot");
                self.restore_wal(client, &remote);
                true
            }
            Err(VolumeError::NotFound(_)) => {
                info!(remote = %remote, "no remote snapshot; starting with a fresh database");
                false
            }
            Err(err) => {
                error!(remote = %remote, error = %err, "snapshot restore failed; starting fresh");
                false
            }
        };
        self.set_state(RescueState::Ready);
        restored
    }

    /// Best-effort restore of the WAL sidecar.
    fn restore_wal(&self, client: &dyn VolumeClient, remote: &VolumePath) {
        let wal_remote = remote.wal_path();
        match client.download(&wal_remote, &self.local_wal_path()) {
            Ok(bytes) => info!(remote = %wal_remote, bytes, "wal sidecar restored"),
            Err(VolumeError::NotFound(_)) => debug!(remote = %wal_remote, "no wal sidecar stored"),
            Err(err) => warn!(remote = %wal_remote, error = %err, "wal sidecar restore failed"),
        }
    }

    /// Marks the local file authoritative without restoring.
    pub fn mark_ready(&self) {
        self.transition(RescueState::Cold, RescueState::Ready);
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    /// Checkpoints and uploads the local file.
    ///
    /// A non-forced snapshot skips when another is in flight. A forced one
    /// waits up to the configured bound and then proceeds. Returns true only
    /// when the main file uploaded.
    pub fn snapshot(&self, force: bool) -> bool {
        let Some(client) = self.client.as_deref() else {
            debug!("snapshot skipped: rescue not configured");
            return false;
        };
        let remote = match self.remote_path() {
            Ok(remote) => remote,
            Err(err) => {
                warn!(error = %err, "snapshot refused");
                return false;
            }
        };
        let permit = if force {
            let permit = self.gate.acquire_within(self.settings.forced_wait);
            if permit.is_none() {
                warn!(
                    wait_ms = u64::try_from(self.settings.forced_wait.as_millis()).unwrap_or(u64::MAX),
                    "in-flight snapshot did not finish; proceeding with forced snapshot"
                );
            }
            permit
        } else {
            match self.gate.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    debug!("snapshot skipped: another snapshot is in flight");
                    return false;
                }
            }
        };
        let entered = self.transition(RescueState::Ready, RescueState::Snapshotting);
        let outcome = self.upload_checkpointed(client, &remote, force);
        if entered {
            self.transition(RescueState::Snapshotting, RescueState::Ready);
        }
        drop(permit);
        self.record_snapshot(force, outcome);
        outcome.is_some()
    }

    /// Runs the checkpoint and uploads; returns the main-file size on success.
    ///
    /// The remote WAL sidecar always ends up matching the checkpoint: removed
    /// after a complete one, replaced after a partial forced one.
    fn upload_checkpointed(
        &self,
        client: &dyn VolumeClient,
        remote: &VolumePath,
        force: bool,
    ) -> Option<u64> {
        let local = self.settings.local_path.as_path();
        if !local.is_file() {
            warn!(local = %local.display(), "snapshot skipped: local database missing");
            return None;
        }
        let outcome = match checkpoint(local, self.settings.checkpoint_busy_timeout) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(local = %local.display(), error = %err, "wal checkpoint failed; snapshot aborted");
                return None;
            }
        };
        if outcome == Checkpoint::Partial && !force {
            warn!("readers pinned wal frames; snapshot deferred to the next interval");
            return None;
        }
        let bytes = match client.upload(local, remote) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(remote = %remote, error = %err, "snapshot upload failed");
                return None;
            }
        };
        info!(remote = %remote, bytes, "snapshot uploaded");
        let wal_remote = remote.wal_path();
        match self.sync_wal(client, &wal_remote, outcome) {
            Ok(()) => Some(bytes),
            Err(err) => {
                error!(
                    remote = %wal_remote,
                    error = %err,
                    "wal sidecar out of sync with snapshot; will retry on the next snapshot"
                );
                None
            }
        }
    }

    /// Makes the remote WAL sidecar match the local one.
    fn sync_wal(
        &self,
        client: &dyn VolumeClient,
        wal_remote: &VolumePath,
        outcome: Checkpoint,
    ) -> Result<(), VolumeError> {
        let wal = self.local_wal_path();
        let pending = wal.metadata().is_ok_and(|metadata| metadata.len() > 0);
        if outcome == Checkpoint::Partial && pending {
            let bytes = client.upload(&wal, wal_remote)?;
            info!(remote = %wal_remote, bytes, "wal sidecar uploaded");
            return Ok(());
        }
        match client.remove(wal_remote) {
            Ok(()) => {
                debug!(remote = %wal_remote, "stale wal sidecar removed");
                Ok(())
            }
            Err(VolumeError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Stores the outcome for status reporting.
    fn record_snapshot(&self, forced: bool, bytes: Option<u64>) {
        let finished_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        *self.last_snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(SnapshotRecord {
            succeeded: bytes.is_some(),
            forced,
            finished_at_ms,
            bytes,
        });
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Starts the periodic snapshot timer.
    ///
    /// Returns false when rescue is unconfigured, the interval is zero, or a
    /// timer was already installed in this process.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::Runtime`] when the timer thread cannot start.
    pub fn start_periodic(self: &Arc<Self>) -> Result<bool, RescueError> {
        let interval = self.settings.snapshot_interval;
        if !self.is_configured() || interval.is_zero() {
            debug!("periodic snapshots disabled");
            return Ok(false);
        }
        if self.timer_installed.swap(true, Ordering::SeqCst) {
            debug!("periodic snapshot timer already installed");
            return Ok(false);
        }
        let (stop, stopped) = mpsc::channel();
        let manager = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(TIMER_THREAD_NAME.to_string())
            .spawn(move || run_timer(&manager, interval, &stopped));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.timer_installed.store(false, Ordering::SeqCst);
                return Err(RescueError::Runtime(err.to_string()));
            }
        };
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(TimerHandle {
            stop,
            thread,
        });
        info!(interval_secs = interval.as_secs(), "periodic snapshot timer started");
        Ok(true)
    }

    /// Stops the periodic timer. The timer stays installed; it cannot be
    /// restarted in this process.
    ///
    /// Waits a bounded time for the timer thread; an in-flight tick that
    /// outlasts the bound is left to finish on its own.
    pub fn stop_timer(&self) {
        let handle = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        if handle.stop.send(()).is_err() {
            warn!("periodic snapshot timer had already exited");
        }
        let deadline = Instant::now() + TIMER_JOIN_TIMEOUT;
        while !handle.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !handle.thread.is_finished() {
            warn!(
                wait_ms = u64::try_from(TIMER_JOIN_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
                "periodic snapshot timer still busy; leaving it to finish"
            );
            return;
        }
        match handle.thread.join() {
            Ok(()) => info!("periodic snapshot timer stopped"),
            Err(_) => error!("periodic snapshot timer thread panicked"),
        }
    }

    /// Returns true while the periodic timer runs.
    #[must_use]
    pub fn timer_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.thread.is_finished())
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stops the timer and takes the final forced snapshot.
    ///
    /// Runs once per manager; later calls return false. Returns true when
    /// the final snapshot uploaded.
    pub fn shutdown(&self) -> bool {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("rescue shutdown already ran");
            return false;
        }
        self.stop_timer();
        if !self.is_configured() {
            self.set_state(RescueState::Terminated);
            return false;
        }
        self.set_state(RescueState::FinalSnapshot);
        let uploaded = self.snapshot(true);
        self.set_state(RescueState::Terminated);
        if uploaded {
            info!("final snapshot uploaded");
        } else {
            warn!("final snapshot failed; changes since the last snapshot may be lost");
        }
        uploaded
    }

    /// Records that this manager owns the process signal hooks.
    pub(crate) fn note_signal_handlers(&self) {
        self.handlers_installed.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Reports configuration, file presence, and timer state.
    ///
    /// Checks remote existence through the client; failures report `None`.
    #[must_use]
    pub fn status(&self) -> RescueStatus {
        let remote = self.remote_path();
        let remote_exists = match (&remote, self.client.as_deref()) {
            (Ok(path), Some(client)) => match client.exists(path) {
                Ok(exists) => Some(exists),
                Err(err) => {
                    warn!(error = %err, "remote snapshot existence check failed");
                    None
                }
            },
            _ => None,
        };
        let remote_path_error = match remote {
            Err(RescueError::InvalidPath(message)) => Some(message),
            _ => None,
        };
        RescueStatus {
            configured: self.is_configured(),
            state: self.state(),
            remote_path: self.settings.remote_path.clone(),
            remote_path_error,
            local_path: self.settings.local_path.display().to_string(),
            local_exists: self.settings.local_path.is_file(),
            remote_exists,
            snapshot_interval_secs: self.settings.snapshot_interval.as_secs(),
            timer_running: self.timer_running(),
            handlers_installed: self.handlers_installed.load(Ordering::SeqCst),
            last_snapshot: *self.last_snapshot.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Returns true while a snapshot holds the upload gate.
    #[must_use]
    pub fn snapshot_in_flight(&self) -> bool {
        self.gate.is_busy()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Flushes the WAL into the main file and truncates it.
fn checkpoint(path: &Path, busy_timeout: Duration) -> Result<Checkpoint, rusqlite::Error> {
    let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    connection.busy_timeout(busy_timeout)?;
    let (busy, log_frames, checkpointed): (i64, i64, i64) = connection
        .query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
    if busy != 0 {
        warn!(log_frames, checkpointed, "wal checkpoint could not complete; readers still active");
        return Ok(Checkpoint::Partial);
    }
    debug!(log_frames, checkpointed, "wal checkpoint complete");
    Ok(Checkpoint::Complete)
}

/// Periodic loop: one non-forced snapshot per interval until stopped.
fn run_timer(manager: &Weak<RescueManager>, interval: Duration, stopped: &mpsc::Receiver<()>) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match catch_unwind(AssertUnwindSafe(|| manager.snapshot(false))) {
            Ok(true) => debug!("periodic snapshot complete"),
            Ok(false) => debug!("periodic snapshot did not upload; retrying next interval"),
            Err(_) => error!("periodic snapshot panicked; retrying next interval"),
        }
    }
    debug!("periodic snapshot timer exited");
}
