//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};

use crate::error::Result;

use super::migrations;

/// Shared handle to the local `SQLite` database.
///
/// Cloning is cheap; every clone talks to the same connection, and all access
/// is serialized through one lock so a read-modify-write of a row cannot
/// interleave with another writer.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        let database = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        };
        database.configure()?;
        database.migrate()?;
        tracing::debug!("Opened local store at {}", database.describe());
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let database = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    fn configure(&self) -> Result<()> {
        let conn = self.conn.lock();
        // journal_mode returns a row and is a no-op for in-memory databases
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
            .ok();
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = 10000;",
        )?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        migrations::run(&mut conn)
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; commits on `Ok`, rolls back on `Err`
    pub fn with_transaction<R>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Filesystem path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn describe(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |path| path.display().to_string())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Database")
            .field("path", &self.describe())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        let one: i64 = db
            .with_connection(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("coop.db");

        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.path(), Some(db_path.as_path()));
        assert!(db_path.exists());

        // Reopening an existing file must not re-run migrations destructively
        drop(db);
        Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO sync_meta (collection, cursor) VALUES ('farms', 10)",
                [],
            )?;
            Err(crate::Error::InvalidInput("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sync_meta", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
