// crates/workshop-store/tests/common/mod.rs
// =============================================================================
// Module: Store Test Helpers
// Description: Shared helpers for store integration tests.
// Purpose: Build SQLite session managers and fingerprint live schemas.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only helpers.")]

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use rusqlite::params;
use workshop_store::MigrationTarget;
use workshop_store::PoolSettings;
use workshop_store::SessionManager;
use workshop_store::SessionRetryPolicy;
use workshop_store::SqliteBackend;
use workshop_store::SqliteOptions;

/// Builds a session manager over a SQLite file with fast retries.
pub fn sqlite_manager(path: &Path) -> SessionManager<SqliteBackend> {
    sqlite_manager_with(path, SqliteOptions::default())
}

/// Builds a session manager with explicit SQLite options.
pub fn sqlite_manager_with(path: &Path, options: SqliteOptions) -> SessionManager<SqliteBackend> {
    let backend = SqliteBackend::new(path, options).expect("sqlite backend");
    SessionManager::new(
        backend,
        PoolSettings::default(),
        SessionRetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        },
    )
    .expect("session manager")
}

/// Runs `f` against a migration target on a fresh session.
pub fn with_target<T>(
    manager: &SessionManager<SqliteBackend>,
    f: impl FnOnce(&mut dyn MigrationTarget) -> T,
) -> T {
    let mut session = manager.acquire_session().expect("session");
    let mut target = session.migration_target();
    f(target.as_mut())
}

/// Column fingerprint: (declared type, not null, primary key).
pub type ColumnPrint = (String, bool, bool);

/// Order-insensitive description of a schema.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchemaFingerprint {
    /// Table name to column name to column fingerprint.
    pub tables: BTreeMap<String, BTreeMap<String, ColumnPrint>>,
    /// Index name to (table, unique, columns).
    pub indexes: BTreeMap<String, (String, bool, Vec<String>)>,
}

/// Reads the schema fingerprint of a SQLite file.
pub fn fingerprint(path: &Path) -> SchemaFingerprint {
    let connection = Connection::open(path).unwrap();
    let mut print = SchemaFingerprint::default();
    let tables: Vec<String> = connection
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for table in tables {
        let columns = connection
            .prepare("SELECT name, upper(type), \"notnull\", pk FROM pragma_table_info(?1)")
            .unwrap()
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0, row.get::<_, i64>(3)? > 0),
                ))
            })
            .unwrap()
            .collect::<Result<BTreeMap<_, _>, _>>()
            .unwrap();
        print.tables.insert(table, columns);
    }
    let indexes: Vec<(String, String)> = connection
        .prepare("SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for (index, table) in indexes {
        let unique: i64 = connection
            .query_row(
                "SELECT \"unique\" FROM pragma_index_list(?1) WHERE name = ?2",
                params![table, index],
                |row| row.get(0),
            )
            .unwrap();
        let columns: Vec<String> = connection
            .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
            .unwrap()
            .query_map(params![index], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        print.indexes.insert(index, (table, unique != 0, columns));
    }
    print
}

/// Returns true when the table exists in the SQLite file.
pub fn table_exists(path: &Path, table: &str) -> bool {
    let connection = Connection::open(path).unwrap();
    connection
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
        > 0
}
