//! Per-collection sync metadata and the conflict log

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{ConflictStrategy, SyncConflict};

/// A conflict about to be written to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConflict<'a> {
    pub record_id: &'a str,
    pub local_updated_at: i64,
    pub incoming_updated_at: Option<i64>,
    pub strategy: ConflictStrategy,
}

/// `SQLite` access to `sync_meta` and `sync_conflicts` for one collection
pub struct SqliteSyncMetaRepository<'a> {
    conn: &'a Connection,
    collection: &'a str,
}

impl<'a> SqliteSyncMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection, collection: &'a str) -> Self {
        Self { conn, collection }
    }

    /// Largest server `updated_at` already downloaded
    pub fn cursor(&self) -> Result<Option<i64>> {
        self.read_column("cursor")
    }

    /// Advance the download cursor; never moves it backwards
    pub fn advance_cursor(&self, cursor: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (collection, cursor) VALUES (?1, ?2)
             ON CONFLICT(collection) DO UPDATE
             SET cursor = MAX(COALESCE(cursor, ?2), ?2)",
            params![self.collection, cursor],
        )?;
        Ok(())
    }

    /// Time the last successful cycle finished
    pub fn last_cycle_at(&self) -> Result<Option<i64>> {
        self.read_column("last_cycle_at")
    }

    pub fn set_last_cycle_at(&self, at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (collection, last_cycle_at) VALUES (?1, ?2)
             ON CONFLICT(collection) DO UPDATE SET last_cycle_at = ?2",
            params![self.collection, at],
        )?;
        Ok(())
    }

    /// Append an entry to the conflict log
    pub fn record_conflict(&self, conflict: &NewConflict<'_>, resolved_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (
                collection, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy
            ) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                self.collection,
                conflict.record_id,
                conflict.local_updated_at,
                conflict.incoming_updated_at,
                resolved_at,
                conflict.strategy.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Most recent conflicts for this collection, newest first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy
             FROM sync_conflicts
             WHERE collection = ?
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;

        let conflicts = stmt
            .query_map(params![self.collection, limit as i64], |row| {
                Ok(SyncConflict {
                    id: row.get(0)?,
                    collection: row.get(1)?,
                    record_id: row.get(2)?,
                    local_updated_at: row.get(3)?,
                    incoming_updated_at: row.get(4)?,
                    resolved_at: row.get(5)?,
                    strategy: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(conflicts)
    }

    fn read_column(&self, column: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                &format!("SELECT {column} FROM sync_meta WHERE collection = ?"),
                params![self.collection],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(value)
    }
}
