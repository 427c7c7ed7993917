//! Database migrations

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::is_valid_collection_name;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: schema tracking and per-collection sync metadata
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS sync_meta (
            collection TEXT PRIMARY KEY,
            cursor INTEGER,
            last_cycle_at INTEGER
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict log
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            incoming_updated_at INTEGER,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record
            ON sync_conflicts(collection, record_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at
            ON sync_conflicts(resolved_at DESC);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

/// Create the record table for a collection if it does not exist yet
pub fn ensure_collection_table(conn: &Connection, collection: &str) -> Result<()> {
    if !is_valid_collection_name(collection) {
        return Err(Error::InvalidInput(format!(
            "invalid collection name: {collection}"
        )));
    }

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {collection} (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            client_updated_at INTEGER NOT NULL,
            server_updated_at INTEGER,
            sync_state TEXT NOT NULL,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            pending_operation TEXT,
            last_attempt_at INTEGER,
            server_payload TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_{collection}_sync_state ON {collection}(sync_state);
        CREATE INDEX IF NOT EXISTS idx_{collection}_updated ON {collection}(client_updated_at DESC);"
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO sync_meta (collection) VALUES (?)",
        params![collection],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            params![name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
        assert!(table_exists(&conn, "sync_meta"));
        assert!(table_exists(&conn, "sync_conflicts"));
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_collection_table_created_once() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        ensure_collection_table(&conn, "farms").unwrap();
        ensure_collection_table(&conn, "farms").unwrap();
        assert!(table_exists(&conn, "farms"));

        let metas: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_meta WHERE collection = 'farms'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(metas, 1);
    }

    #[test]
    fn test_collection_name_is_validated() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        assert!(ensure_collection_table(&conn, "farms; DROP TABLE sync_meta").is_err());
    }
}
