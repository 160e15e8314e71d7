// crates/workshop-rescue/src/lib.rs
// ============================================================================
// Module: Workshop Rescue
// Description: Volume-backed durability for the embedded workshop database.
// Purpose: Restore the database on start and snapshot it periodically and on
//          shutdown so container recycling does not lose data.
// Dependencies: reqwest, rusqlite, signal-hook, tokio, tracing
// ============================================================================

//! ## Overview
//! The deployment environment reclaims local disk on every restart. This
//! crate treats a remote volume as the system of record for disaster
//! recovery:
//! - [`RescueManager::restore`] downloads the last snapshot before anything
//!   opens the database.
//! - [`RescueManager::snapshot`] checkpoints the WAL and uploads the file.
//! - [`RescueManager::start_periodic`] and [`install_signal_handlers`] keep
//!   snapshots flowing during the process lifetime and at exit.
//!
//! Durability failures are logged and reported as `false`; they never abort
//! startup or shutdown.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod manager;
pub mod path;
pub mod signals;
pub mod volume;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use manager::RescueError;
pub use manager::RescueManager;
pub use manager::RescueSettings;
pub use manager::RescueState;
pub use manager::RescueStatus;
pub use manager::SnapshotRecord;
pub use path::DEFAULT_SNAPSHOT_FILE;
pub use path::PathError;
pub use path::VolumePath;
pub use path::resolve_remote_path;
pub use path::validate_path;
pub use signals::TerminationSignal;
pub use signals::install_signal_handlers;
pub use signals::signal_handlers_installed;
pub use volume::FilesApiVolumeClient;
pub use volume::LocalVolumeClient;
pub use volume::VolumeClient;
pub use volume::VolumeError;
