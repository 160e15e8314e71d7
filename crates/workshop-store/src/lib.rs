// crates/workshop-store/src/lib.rs
// ============================================================================
// Module: Workshop Store
// Description: Database sessions, schema migrations, and write coordination.
// Purpose: Keep the workshop database consistent under concurrent writers and
//          across schema changes on SQLite and Postgres.
// Dependencies: postgres, r2d2, rusqlite, tracing
// ============================================================================

//! ## Overview
//! `workshop-store` is the persistence layer of the annotation workshop
//! platform. It provides:
//! - [`SessionManager`]: pooled sessions with health checks, pool reset on
//!   connection faults, and credential refresh.
//! - [`MigrationEngine`]: a revision DAG runner that converges fresh,
//!   versioned, and hand-patched legacy databases on one schema.
//! - [`WriteCoordinator`]: upserts and contention retries so concurrent
//!   writers on one logical key produce exactly one row.
//!
//! Both [`SqliteBackend`] and [`PostgresBackend`] implement
//! [`StoreBackend`]; callers pick one from a [`DatabaseTarget`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod backend;
pub mod error;
pub mod migrate;
pub mod postgres;
pub mod revisions;
pub mod session;
pub mod sqlite;
pub mod write;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use backend::BackendConnection;
pub use backend::BackendKind;
pub use backend::DatabaseTarget;
pub use backend::StoreBackend;
pub use backend::TransactionMode;
pub use error::CONNECTION_ERROR_MARKERS;
pub use error::SessionError;
pub use error::is_connection_error;
pub use error::message_marks_connection_error;
pub use migrate::ColumnInfo;
pub use migrate::DatabaseState;
pub use migrate::Downgrade;
pub use migrate::MigrationEngine;
pub use migrate::MigrationError;
pub use migrate::MigrationTarget;
pub use migrate::REVISION_TABLE;
pub use migrate::Revision;
pub use migrate::SchemaOps;
pub use migrate::TableRebuild;
pub use migrate::UpgradeReport;
pub use postgres::CredentialSource;
pub use postgres::PostgresBackend;
pub use postgres::PostgresOptions;
pub use postgres::StaticCredentials;
pub use postgres::TokenFileCredentials;
pub use revisions::workshop_engine;
pub use revisions::workshop_revisions;
pub use session::PoolSettings;
pub use session::Session;
pub use session::SessionManager;
pub use session::SessionRetryPolicy;
pub use sqlite::SqliteBackend;
pub use sqlite::SqliteJournalMode;
pub use sqlite::SqliteOptions;
pub use sqlite::SqliteSyncMode;
pub use write::AnnotationUpsert;
pub use write::SqlValue;
pub use write::Upsert;
pub use write::WriteCoordinator;
pub use write::WriteError;
pub use write::WriteRetryPolicy;
