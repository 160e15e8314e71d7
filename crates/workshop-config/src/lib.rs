// crates/workshop-config/src/lib.rs
// ============================================================================
// Module: Workshop Config Library
// Description: Configuration model for the workshop database layer.
// Purpose: Single source of truth for workshop.toml and its environment
//          overrides.
// Dependencies: serde, toml, workshop-rescue, workshop-store
// ============================================================================

//! ## Overview
//! `workshop-config` loads the database, snapshot, and logging settings from
//! an optional TOML file, applies environment overrides, and validates the
//! result before anything opens a connection. Invalid input fails closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
