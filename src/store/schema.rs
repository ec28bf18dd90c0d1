//! DuckDB schema definitions, migration support, and the test record type.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

pub const DDL_MASHUP_TESTS: &str = "\
CREATE TABLE IF NOT EXISTS mashup_tests (
    id TEXT PRIMARY KEY,
    mashup_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    results TEXT NOT NULL,
    write_seq BIGINT NOT NULL
);";

pub const DDL_INDEX_TESTS_MASHUP: &str = "\
CREATE INDEX IF NOT EXISTS idx_tests_mashup ON mashup_tests(mashup_id);";

pub const DDL_INDEX_TESTS_TIMESTAMP: &str = "\
CREATE INDEX IF NOT EXISTS idx_tests_timestamp ON mashup_tests(created_at);";

/// Version 1: the collection and its mashup index.
pub const SCHEMA_V1: &[&str] = &[DDL_SCHEMA_VERSION, DDL_MASHUP_TESTS, DDL_INDEX_TESTS_MASHUP];

/// Version 2: timestamp index for newest-first scans.
pub const SCHEMA_V2: &[&str] = &[DDL_INDEX_TESTS_TIMESTAMP];

pub const CURRENT_VERSION: i32 = 2;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Every step is additive (`IF NOT EXISTS`), so upgrading an older database
/// keeps its records. Returns the resulting version.
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)?;

    let current = get_current_version(conn)?;
    if current > CURRENT_VERSION {
        return Err(MigrationError::TooNew {
            found: current,
            supported: CURRENT_VERSION,
        });
    }
    if current == CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        apply_version(conn, 1, SCHEMA_V1)?;
    }
    if current < 2 {
        apply_version(conn, 2, SCHEMA_V2)?;
    }

    Ok(CURRENT_VERSION)
}

/// Run one version's DDL and record it.
pub fn apply_version(
    conn: &duckdb::Connection,
    version: i32,
    ddl: &[&str],
) -> Result<(), MigrationError> {
    for statement in ddl {
        conn.execute_batch(statement)?;
    }
    record_version(conn, version)?;
    tracing::debug!(version, "test store schema migrated");
    Ok(())
}

pub fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("DuckDB migration error: {0}")]
    Duckdb(#[from] duckdb::Error),

    #[error("database schema version {found} is newer than supported version {supported}")]
    TooNew { found: i32, supported: i32 },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One executed mashup test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    /// Computation-group id. Unique across the whole store.
    pub id: String,
    pub mashup_id: String,
    /// ISO-8601 UTC with millisecond precision, assigned at write time.
    pub timestamp: String,
    /// Opaque computation outcome: results, evidences, or an error.
    pub results: serde_json::Value,
}

impl TestRecord {
    /// New record stamped with the current time.
    pub fn stamped(
        mashup_id: impl Into<String>,
        id: impl Into<String>,
        results: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            mashup_id: mashup_id.into(),
            timestamp: now_timestamp(),
            results,
        }
    }
}

/// Fixed-width UTC timestamp, so lexical order is chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn index_names(conn: &duckdb::Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT index_name FROM duckdb_indexes() \
                 WHERE table_name = 'mashup_tests' AND index_name LIKE 'idx_%' \
                 ORDER BY index_name",
            )
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn ddl_constants_are_valid_sql() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        for (i, ddl) in SCHEMA_V1.iter().chain(SCHEMA_V2).enumerate() {
            conn.execute_batch(ddl)
                .unwrap_or_else(|e| panic!("DDL statement {i} is invalid SQL: {e}"));
        }
    }

    #[test]
    fn apply_migrations_creates_table_and_indices() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let version = apply_migrations(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);

        conn.execute_batch("SELECT COUNT(*) FROM mashup_tests").unwrap();
        assert_eq!(
            index_names(&conn),
            vec!["idx_tests_mashup".to_string(), "idx_tests_timestamp".to_string()]
        );
    }

    #[test]
    fn apply_migrations_is_idempotent() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let v1 = apply_migrations(&conn).unwrap();
        let v2 = apply_migrations(&conn).unwrap();
        assert_eq!(v1, v2);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, i64::from(CURRENT_VERSION));
    }

    #[test]
    fn upgrade_from_v1_keeps_records() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_version(&conn, 1, SCHEMA_V1).unwrap();
        conn.execute(
            "INSERT INTO mashup_tests (id, mashup_id, created_at, results, write_seq) \
             VALUES (?, ?, ?, ?, ?)",
            duckdb::params!["t1", "m1", "2026-01-01T00:00:00.000Z", r#"{"ok":true}"#, 1_i64],
        )
        .unwrap();
        assert_eq!(index_names(&conn), vec!["idx_tests_mashup".to_string()]);

        let version = apply_migrations(&conn).unwrap();

        assert_eq!(version, 2);
        assert_eq!(index_names(&conn).len(), 2);
        let results: String = conn
            .query_row("SELECT results FROM mashup_tests WHERE id = 't1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(results, r#"{"ok":true}"#);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        record_version(&conn, CURRENT_VERSION + 1).unwrap();

        let err = apply_migrations(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::TooNew { .. }));
    }

    #[test]
    fn applied_at_is_epoch_ms() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied_at: i64 = conn
            .query_row(
                "SELECT applied_at FROM schema_version WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // after 2024-01-01
        assert!(applied_at > 1_704_067_200_000, "{applied_at}");
    }

    #[test]
    fn timestamps_are_fixed_width_utc() {
        let ts = now_timestamp();
        assert_eq!(ts.len(), "2026-10-19T12:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = TestRecord::stamped("m1", "t1", serde_json::json!({"ok": true}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["mashupId"], "m1");
        assert_eq!(value["results"]["ok"], true);
    }
}
