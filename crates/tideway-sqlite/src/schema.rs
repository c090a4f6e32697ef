use crate::store::map_sqlite_err;
use rusqlite::Connection;
use tideway_core::error::{Result, TidewayError};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Create all tables if needed and check the stored schema version
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tideway_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS partitions (
            partition_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS change_feed (
            partition_id TEXT NOT NULL,
            token INTEGER NOT NULL,
            payload BLOB NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            PRIMARY KEY (partition_id, token)
        );

        CREATE TABLE IF NOT EXISTS leases (
            partition_id TEXT PRIMARY KEY,
            owner_id TEXT,
            expires_at_ms INTEGER NOT NULL,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS continuations (
            partition_id TEXT PRIMARY KEY,
            token INTEGER NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS views (
            key TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            total REAL NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            partition_id TEXT NOT NULL,
            first_token INTEGER,
            last_token INTEGER,
            records TEXT NOT NULL,
            error TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_partition
            ON dead_letters(partition_id);",
    )
    .map_err(map_sqlite_err)?;

    conn.execute(
        "INSERT OR IGNORE INTO tideway_meta (id, schema_version) VALUES (0, ?1)",
        [SCHEMA_VERSION as i64],
    )
    .map_err(map_sqlite_err)?;

    let stored = schema_version(conn)?;
    if stored > SCHEMA_VERSION {
        return Err(TidewayError::InvalidState(format!(
            "Database schema version {} is newer than supported version {}",
            stored, SCHEMA_VERSION
        )));
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn
        .query_row(
            "SELECT schema_version FROM tideway_meta WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite_err)?;

    Ok(version as u32)
}
