//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use coweave_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than supported {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis() as i64],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue
        CREATE TABLE covalues (
            row_id INTEGER PRIMARY KEY,
            id BLOB NOT NULL UNIQUE,          -- 32 bytes, hash of the canonical header
            header BLOB NOT NULL              -- canonical CBOR header
        );

        -- One row per (CoValue, session)
        CREATE TABLE sessions (
            row_id INTEGER PRIMARY KEY,
            covalue INTEGER NOT NULL REFERENCES covalues(row_id),
            session_id TEXT NOT NULL,
            len INTEGER NOT NULL,             -- number of stored transactions
            last_signature BLOB NOT NULL,     -- 64 bytes, signs the whole stored session
            bytes_since_signature INTEGER NOT NULL,

            UNIQUE(covalue, session_id)
        );

        CREATE TABLE transactions (
            session INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            tx BLOB NOT NULL,                 -- canonical CBOR transaction
            PRIMARY KEY (session, idx)
        );

        -- Checkpoint signatures, each over the session up to and including idx
        CREATE TABLE signature_after (
            session INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            signature BLOB NOT NULL,
            PRIMARY KEY (session, idx)
        );

        CREATE INDEX idx_sessions_covalue ON sessions(covalue);
        "#,
    )?;

    Ok(())
}
