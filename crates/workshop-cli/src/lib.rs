// crates/workshop-cli/src/lib.rs
// ============================================================================
// Module: Workshop CLI Library
// Description: Process lifecycle shared by the `workshop-db` binary and the
//              service that embeds the database layer.
// Purpose: Order restore, migration, and snapshots around process start and
//          stop.
// Dependencies: tracing-subscriber, workshop-config, workshop-rescue,
//               workshop-store
// ============================================================================

//! ## Overview
//! [`lifecycle::WorkshopRuntime::on_startup`] restores the database from its
//! last snapshot, opens the pool, and upgrades the schema before anything
//! serves a request. [`lifecycle::WorkshopRuntime::on_shutdown`] takes the
//! final snapshot. The process-wide runtime lives in a [`std::sync::OnceLock`]
//! so request handlers reach it through [`lifecycle::acquire_session`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod lifecycle;
pub mod logging;
