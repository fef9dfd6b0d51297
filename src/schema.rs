//! # SQLite Schema for the CVR Store
//!
//! DDL and database initialization for the durable Client View Record
//! store. One database holds the CVRs of many client groups; every table is
//! keyed by `client_group_id`.
//!
//! ## Table Overview
//!
//! ```text
//! instances                 clients                  desires
//! ┌─────────────────────┐   ┌──────────────────┐    ┌──────────────────────┐
//! │ client_group_id PK  │   │ client_group_id  │    │ client_group_id      │
//! │ owner/ownership_time│   │ client_id        │    │ client_id            │
//! │ state/minor version │   └──────────────────┘    │ query_hash           │
//! │ replica_version     │                           │ ttl / inactivated_at │
//! │ ttl_clock/last_activ│   queries                 │ deleted (tombstone)  │
//! │ client_schema       │   ┌──────────────────┐    │ patch version        │
//! └─────────────────────┘   │ query_hash       │    └──────────────────────┘
//!                           │ query_type/def   │
//! rows                      │ got / deleted    │
//! ┌─────────────────────┐   │ patch version    │
//! │ table_name, row_key │   └──────────────────┘
//! │ row_version         │
//! │ ref_counts (JSON)   │
//! │ value (JSON)        │
//! │ patch version       │
//! └─────────────────────┘
//! ```
//!
//! Patch versions are stored as `(state_version TEXT, minor_version
//! INTEGER)` pairs. `state_version` strings order lexicographically (see
//! [`crate::types::StateVersion`]), so catch-up scans are plain range
//! queries over the pair.
//!
//! Tombstones (`deleted = 1` on `desires`/`queries`, NULL `ref_counts` on
//! `rows`) are retained after eviction so that replayed catch-ups emit
//! idempotent `del` patches.

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Opening a database with a different version is an
/// error; there is no migration support yet.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per client group: ownership, version, replica binding, and the
/// TTL clock. The `(state_version, minor_version)` pair is the target of the
/// optimistic compare-and-swap performed by every flush.
const CREATE_INSTANCES: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    client_group_id TEXT PRIMARY KEY,
    owner           TEXT,
    ownership_time  INTEGER NOT NULL DEFAULT 0,
    state_version   TEXT NOT NULL,
    minor_version   INTEGER NOT NULL,
    replica_version TEXT NOT NULL,
    ttl_clock       INTEGER NOT NULL DEFAULT 0,
    last_active     INTEGER NOT NULL DEFAULT 0,
    client_schema   TEXT
) WITHOUT ROWID;
"#;

/// Client membership of a group. Desired-query state lives in `desires`.
const CREATE_CLIENTS: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    client_group_id TEXT NOT NULL,
    client_id       TEXT NOT NULL,
    PRIMARY KEY (client_group_id, client_id)
) WITHOUT ROWID;
"#;

/// Durable projection of per-client query state. `inactivated_at` is NULL
/// while the client still desires the query; `deleted = 1` is the tombstone
/// left behind by eviction.
const CREATE_DESIRES: &str = r#"
CREATE TABLE IF NOT EXISTS desires (
    client_group_id TEXT NOT NULL,
    client_id       TEXT NOT NULL,
    query_hash      TEXT NOT NULL,
    ttl             INTEGER NOT NULL,
    inactivated_at  INTEGER,
    deleted         INTEGER NOT NULL DEFAULT 0,
    state_version   TEXT NOT NULL,
    minor_version   INTEGER NOT NULL,
    PRIMARY KEY (client_group_id, client_id, query_hash)
) WITHOUT ROWID;
"#;

/// Query records. `query_type` is 'client' or 'internal'; `definition` holds
/// the AST or name+args as JSON. `got = 1` once the query has been hydrated.
const CREATE_QUERIES: &str = r#"
CREATE TABLE IF NOT EXISTS queries (
    client_group_id TEXT NOT NULL,
    query_hash      TEXT NOT NULL,
    query_type      TEXT NOT NULL,
    definition      TEXT NOT NULL,
    got             INTEGER NOT NULL DEFAULT 0,
    deleted         INTEGER NOT NULL DEFAULT 0,
    state_version   TEXT NOT NULL,
    minor_version   INTEGER NOT NULL,
    PRIMARY KEY (client_group_id, query_hash)
) WITHOUT ROWID;
"#;

/// Row records: per-query reference counts and the last row payload.
/// `ref_counts` is a JSON object `{query_hash: count}`; NULL means the row
/// was deleted from the visible set (the tombstone state). The payload is
/// retained so catch-up can replay `put` patches without re-running queries.
const CREATE_ROWS: &str = r#"
CREATE TABLE IF NOT EXISTS rows (
    client_group_id TEXT NOT NULL,
    table_name      TEXT NOT NULL,
    row_key         TEXT NOT NULL,
    row_version     TEXT NOT NULL,
    ref_counts      TEXT,
    value           TEXT,
    state_version   TEXT NOT NULL,
    minor_version   INTEGER NOT NULL,
    PRIMARY KEY (client_group_id, table_name, row_key)
) WITHOUT ROWID;
"#;

/// Catch-up scans read every patch with version greater than a client's
/// cookie; these indexes keep that a range scan per table.
const CREATE_PATCH_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS desires_patch_version
    ON desires (client_group_id, state_version, minor_version);
CREATE INDEX IF NOT EXISTS queries_patch_version
    ON queries (client_group_id, state_version, minor_version);
CREATE INDEX IF NOT EXISTS rows_patch_version
    ON rows (client_group_id, state_version, minor_version);
"#;

/// Store metadata, currently just the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS viewsync_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

// =============================================================================
// Database
// =============================================================================

/// An initialized CVR database.
///
/// Wraps a `rusqlite::Connection` whose schema has been created or verified.
/// Call [`Database::into_connection`] to hand the connection to the store
/// thread.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if necessary) a CVR database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Opens an in-memory CVR database. In-memory databases are
    /// single-connection; use a file path when readers and writers must
    /// coexist.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(CREATE_INSTANCES)?;
        conn.execute_batch(CREATE_CLIENTS)?;
        conn.execute_batch(CREATE_DESIRES)?;
        conn.execute_batch(CREATE_QUERIES)?;
        conn.execute_batch(CREATE_ROWS)?;
        conn.execute_batch(CREATE_PATCH_INDEXES)?;
        conn.execute_batch(CREATE_METADATA)?;

        verify_schema_version(&conn)?;

        Ok(Self { conn })
    }

    /// Consumes the database, returning the underlying connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Borrow the underlying connection (tests and tooling).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn verify_schema_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM viewsync_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO viewsync_metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => Ok(()),
        Some(v) => Err(Error::Schema(format!(
            "database has schema version {}, this build supports {}",
            v, SCHEMA_VERSION
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('instances', 'clients', 'desires', 'queries', 'rows')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_schema_version_persisted() {
        let db = Database::open_in_memory().unwrap();
        let v: String = db
            .connection()
            .query_row(
                "SELECT value FROM viewsync_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(v, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cvr.db");
        {
            let _db = Database::open(&path).unwrap();
        }
        // Second open verifies rather than recreates.
        let _db = Database::open(&path).unwrap();
    }

    #[test]
    fn test_schema_version_mismatch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cvr.db");
        {
            let db = Database::open(&path).unwrap();
            db.connection()
                .execute(
                    "UPDATE viewsync_metadata SET value = '999' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }
        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
