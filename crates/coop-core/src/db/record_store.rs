//! Generic record store implementation

use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{PendingOperation, RecordId, SyncConflict, SyncEntity, SyncRecord, SyncState};

use super::connection::Database;
use super::migrations::ensure_collection_table;
use super::sync_meta_repository::{NewConflict, SqliteSyncMetaRepository};

/// Filter for [`RecordStore::list_all`]
pub enum RecordFilter<T> {
    /// Every record
    All,
    /// Case-insensitive substring match on [`SyncEntity::search_text`]
    Search(String),
    /// Records in one sync state
    State(SyncState),
    /// Arbitrary predicate over the payload
    Predicate(Arc<dyn Fn(&T) -> bool + Send + Sync>),
}

impl<T> RecordFilter<T> {
    /// Build a predicate filter
    pub fn predicate(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }
}

impl<T: SyncEntity> RecordFilter<T> {
    /// Whether `record` passes the filter
    pub fn matches(&self, record: &SyncRecord<T>) -> bool {
        match self {
            Self::All => true,
            Self::Search(query) => {
                let query = query.trim().to_lowercase();
                query.is_empty() || record.payload.search_text().to_lowercase().contains(&query)
            }
            Self::State(state) => record.sync_state == *state,
            Self::Predicate(predicate) => predicate(&record.payload),
        }
    }
}

impl<T> Default for RecordFilter<T> {
    fn default() -> Self {
        Self::All
    }
}

impl<T> Clone for RecordFilter<T> {
    fn clone(&self) -> Self {
        match self {
            Self::All => Self::All,
            Self::Search(query) => Self::Search(query.clone()),
            Self::State(state) => Self::State(*state),
            Self::Predicate(predicate) => Self::Predicate(Arc::clone(predicate)),
        }
    }
}

impl<T> std::fmt::Debug for RecordFilter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Search(query) => f.debug_tuple("Search").field(query).finish(),
            Self::State(state) => f.debug_tuple("State").field(state).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Outcome of an [`RecordStore::update_with`] closure
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite<T> {
    /// Leave the row as it is
    Unchanged,
    /// Overwrite (or insert) the row under the record's own id
    Upsert(SyncRecord<T>),
    /// Remove the row
    Delete,
    /// Remove the row and store the record under its (new) id
    Rekey(SyncRecord<T>),
}

/// Trait for sync record storage operations
///
/// All methods are synchronous; implementations must never touch the network.
pub trait RecordStore<T: SyncEntity>: Send + Sync {
    /// Get a record by ID
    fn get(&self, id: &RecordId) -> Result<Option<SyncRecord<T>>>;

    /// Insert or overwrite a record by ID
    fn upsert(&self, record: &SyncRecord<T>) -> Result<()>;

    /// Remove a record; removing a missing record is not an error
    fn delete(&self, id: &RecordId) -> Result<()>;

    /// List records passing `filter`, most recently edited first
    fn list_all(&self, filter: &RecordFilter<T>) -> Result<Vec<SyncRecord<T>>>;

    /// All records whose state is not `Synced`, oldest edit first
    fn list_pending_sync(&self) -> Result<Vec<SyncRecord<T>>>;

    /// Atomic read-modify-write of one row.
    ///
    /// `f` sees the current row and decides what to write; no other writer can
    /// touch the store in between.
    fn update_with<R, F>(&self, id: &RecordId, f: F) -> Result<R>
    where
        F: FnOnce(Option<SyncRecord<T>>) -> (StoreWrite<T>, R);

    /// Move the row stored under `old_id` to `record.id`
    fn replace_id(&self, old_id: &RecordId, record: &SyncRecord<T>) -> Result<()> {
        self.update_with(old_id, |_| (StoreWrite::Rekey(record.clone()), ()))
    }

    /// Change notifications; the value increments on every write
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Download cursor for incremental fetches
    fn cursor(&self) -> Result<Option<i64>>;

    fn advance_cursor(&self, cursor: i64) -> Result<()>;

    /// Finish time of the last successful reconciliation cycle
    fn last_cycle_at(&self) -> Result<Option<i64>>;

    fn set_last_cycle_at(&self, at: i64) -> Result<()>;

    /// Append to the conflict log
    fn record_conflict(&self, conflict: &NewConflict<'_>) -> Result<()>;

    /// Most recent conflicts, newest first
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `RecordStore`, one table per collection
pub struct SqliteRecordStore<T> {
    db: Database,
    changes: Arc<watch::Sender<u64>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for SqliteRecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            changes: Arc::clone(&self.changes),
            _payload: PhantomData,
        }
    }
}

const COLUMNS: &str = "id, payload, client_updated_at, server_updated_at, sync_state, \
                       sync_attempts, last_error, pending_operation, last_attempt_at, server_payload";

/// Row as stored, before payload decoding
struct RawRecord {
    id: String,
    payload: String,
    client_updated_at: i64,
    server_updated_at: Option<i64>,
    sync_state: String,
    sync_attempts: u32,
    last_error: Option<String>,
    pending_operation: Option<String>,
    last_attempt_at: Option<i64>,
    server_payload: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            client_updated_at: row.get(2)?,
            server_updated_at: row.get(3)?,
            sync_state: row.get(4)?,
            sync_attempts: row.get(5)?,
            last_error: row.get(6)?,
            pending_operation: row.get(7)?,
            last_attempt_at: row.get(8)?,
            server_payload: row.get(9)?,
        })
    }

    fn decode<T: SyncEntity>(self) -> Result<SyncRecord<T>> {
        Ok(SyncRecord {
            id: RecordId::from(self.id),
            payload: serde_json::from_str(&self.payload)?,
            client_updated_at: self.client_updated_at,
            server_updated_at: self.server_updated_at,
            sync_state: self.sync_state.parse()?,
            sync_attempts: self.sync_attempts,
            last_error: self.last_error,
            pending_operation: self
                .pending_operation
                .as_deref()
                .map(str::parse::<PendingOperation>)
                .transpose()?,
            last_attempt_at: self.last_attempt_at,
            server_payload: self
                .server_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

impl<T: SyncEntity> SqliteRecordStore<T> {
    /// Open the store for `T::COLLECTION`, creating its table if needed
    pub fn open(db: &Database) -> Result<Self> {
        db.with_connection(|conn| ensure_collection_table(conn, T::COLLECTION))?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            db: db.clone(),
            changes: Arc::new(changes),
            _payload: PhantomData,
        })
    }

    /// Number of rows not in `Synced`
    pub fn pending_count(&self) -> Result<usize> {
        self.db.with_connection(|conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE sync_state != ?",
                    T::COLLECTION
                ),
                params![SyncState::Synced.as_str()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn select_one(conn: &Connection, id: &RecordId) -> Result<Option<SyncRecord<T>>> {
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM {} WHERE id = ?", T::COLLECTION),
                params![id.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn write_row(conn: &Connection, record: &SyncRecord<T>) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let server_payload = record
            .server_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                T::COLLECTION
            ),
            params![
                record.id.as_str(),
                payload,
                record.client_updated_at,
                record.server_updated_at,
                record.sync_state.as_str(),
                record.sync_attempts,
                record.last_error,
                record.pending_operation.map(PendingOperation::as_str),
                record.last_attempt_at,
                server_payload,
            ],
        )?;
        Ok(())
    }

    fn delete_row(conn: &Connection, id: &RecordId) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", T::COLLECTION),
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn select_where(
        conn: &Connection,
        clause: &str,
        order: &str,
        state: &str,
    ) -> Result<Vec<SyncRecord<T>>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} {clause} ORDER BY {order}",
            T::COLLECTION
        ))?;
        let raws = if clause.is_empty() {
            stmt.query_map([], RawRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![state], RawRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(RawRecord::decode).collect()
    }

    fn meta<R>(&self, f: impl FnOnce(&SqliteSyncMetaRepository<'_>) -> Result<R>) -> Result<R> {
        self.db
            .with_connection(|conn| f(&SqliteSyncMetaRepository::new(conn, T::COLLECTION)))
    }
}

impl<T: SyncEntity> RecordStore<T> for SqliteRecordStore<T> {
    fn get(&self, id: &RecordId) -> Result<Option<SyncRecord<T>>> {
        self.db.with_connection(|conn| Self::select_one(conn, id))
    }

    fn upsert(&self, record: &SyncRecord<T>) -> Result<()> {
        self.db.with_connection(|conn| Self::write_row(conn, record))?;
        self.notify();
        Ok(())
    }

    fn delete(&self, id: &RecordId) -> Result<()> {
        self.db.with_connection(|conn| Self::delete_row(conn, id))?;
        self.notify();
        Ok(())
    }

    fn list_all(&self, filter: &RecordFilter<T>) -> Result<Vec<SyncRecord<T>>> {
        let records = self.db.with_connection(|conn| match filter {
            RecordFilter::State(state) => Self::select_where(
                conn,
                "WHERE sync_state = ?",
                "client_updated_at DESC, id",
                state.as_str(),
            ),
            _ => Self::select_where(conn, "", "client_updated_at DESC, id", ""),
        })?;
        Ok(records
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    fn list_pending_sync(&self) -> Result<Vec<SyncRecord<T>>> {
        self.db.with_connection(|conn| {
            Self::select_where(
                conn,
                "WHERE sync_state != ?",
                "client_updated_at ASC, id",
                SyncState::Synced.as_str(),
            )
        })
    }

    fn update_with<R, F>(&self, id: &RecordId, f: F) -> Result<R>
    where
        F: FnOnce(Option<SyncRecord<T>>) -> (StoreWrite<T>, R),
    {
        let (changed, value) = self.db.with_transaction(|tx| {
            let current = Self::select_one(tx, id)?;
            let (write, value) = f(current);
            let changed = match write {
                StoreWrite::Unchanged => false,
                StoreWrite::Upsert(record) => {
                    Self::write_row(tx, &record)?;
                    true
                }
                StoreWrite::Delete => {
                    Self::delete_row(tx, id)?;
                    true
                }
                StoreWrite::Rekey(record) => {
                    Self::delete_row(tx, id)?;
                    Self::write_row(tx, &record)?;
                    true
                }
            };
            Ok((changed, value))
        })?;

        if changed {
            self.notify();
        }
        Ok(value)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn cursor(&self) -> Result<Option<i64>> {
        self.meta(|repo| repo.cursor())
    }

    fn advance_cursor(&self, cursor: i64) -> Result<()> {
        self.meta(|repo| repo.advance_cursor(cursor))
    }

    fn last_cycle_at(&self) -> Result<Option<i64>> {
        self.meta(|repo| repo.last_cycle_at())
    }

    fn set_last_cycle_at(&self, at: i64) -> Result<()> {
        self.meta(|repo| repo.set_last_cycle_at(at))
    }

    fn record_conflict(&self, conflict: &NewConflict<'_>) -> Result<()> {
        let now = crate::util::unix_millis_now();
        self.meta(|repo| repo.record_conflict(conflict, now))
    }

    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.meta(|repo| repo.list_conflicts(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Farm, RemoteRecord};
    use pretty_assertions::assert_eq;

    fn setup() -> SqliteRecordStore<Farm> {
        let db = Database::open_in_memory().unwrap();
        SqliteRecordStore::open(&db).unwrap()
    }

    fn synced(id: &str, name: &str, at: i64) -> SyncRecord<Farm> {
        SyncRecord::from_remote(RemoteRecord {
            id: RecordId::from(id),
            payload: Farm::new("owner", name),
            updated_at: at,
        })
    }

    #[test]
    fn test_upsert_and_get() {
        let store = setup();
        let record = SyncRecord::new_local(RecordId::from("f1"), Farm::new("u1", "Green"), 10);
        store.upsert(&record).unwrap();

        let fetched = store.get(&record.id).unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.get(&RecordId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_by_id() {
        let store = setup();
        store.upsert(&synced("f1", "Old", 1)).unwrap();
        store.upsert(&synced("f1", "New", 2)).unwrap();

        let all = store.list_all(&RecordFilter::All).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload.name, "New");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = setup();
        store.upsert(&synced("f1", "Farm", 1)).unwrap();
        store.delete(&RecordId::from("f1")).unwrap();
        store.delete(&RecordId::from("f1")).unwrap();
        assert!(store.list_all(&RecordFilter::All).unwrap().is_empty());
    }

    #[test]
    fn test_list_pending_sync_excludes_synced() {
        let store = setup();
        store.upsert(&synced("f1", "Synced", 1)).unwrap();
        store
            .upsert(&SyncRecord::new_local(
                RecordId::from("f2"),
                Farm::new("u1", "Local"),
                5,
            ))
            .unwrap();
        let mut failed = synced("f3", "Failed", 1);
        failed.apply_local_edit(Farm::new("owner", "Failed 2"), 3);
        failed.mark_failed("HTTP 500", 4);
        store.upsert(&failed).unwrap();

        let pending = store.list_pending_sync().unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["f3", "f2"]);
        assert_eq!(store.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_list_all_filters() {
        let store = setup();
        store.upsert(&synced("f1", "Green Acres", 1)).unwrap();
        store.upsert(&synced("f2", "Red Barn", 2)).unwrap();
        store
            .upsert(&SyncRecord::new_local(
                RecordId::from("f3"),
                Farm::new("u1", "green valley"),
                3,
            ))
            .unwrap();

        let search = store
            .list_all(&RecordFilter::Search("GREEN".to_string()))
            .unwrap();
        assert_eq!(search.len(), 2);

        let pending = store
            .list_all(&RecordFilter::State(SyncState::PendingCreate))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.as_str(), "f3");

        let barns = store
            .list_all(&RecordFilter::predicate(|farm: &Farm| farm.name.contains("Barn")))
            .unwrap();
        assert_eq!(barns.len(), 1);
    }

    #[test]
    fn test_update_with_rekey_moves_row() {
        let store = setup();
        let local = SyncRecord::new_local(RecordId::from("client-x"), Farm::new("u1", "F"), 1);
        store.upsert(&local).unwrap();

        let mut acked = local.clone();
        acked.id = RecordId::from("server-y");
        acked.mark_synced(50);
        store.replace_id(&local.id, &acked).unwrap();

        assert!(store.get(&RecordId::from("client-x")).unwrap().is_none());
        let moved = store.get(&RecordId::from("server-y")).unwrap().unwrap();
        assert_eq!(moved.sync_state, SyncState::Synced);
        assert_eq!(store.list_all(&RecordFilter::All).unwrap().len(), 1);
    }

    #[test]
    fn test_update_with_unchanged_does_not_notify() {
        let store = setup();
        let mut changes = store.subscribe();
        store.upsert(&synced("f1", "Farm", 1)).unwrap();
        assert!(changes.has_changed().unwrap());
        let _ = changes.borrow_and_update();

        let seen = store
            .update_with(&RecordId::from("f1"), |current| {
                (StoreWrite::Unchanged, current.is_some())
            })
            .unwrap();
        assert!(seen);
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_conflict_payload_roundtrip() {
        let store = setup();
        let mut record = synced("f1", "Mine", 1);
        record.apply_local_edit(Farm::new("owner", "Mine v2"), 2);
        record.server_payload = Some(Farm::new("owner", "Theirs"));
        record.mark_conflict("stale version");
        store.upsert(&record).unwrap();

        let fetched = store.get(&record.id).unwrap().unwrap();
        assert_eq!(fetched.server_payload.unwrap().name, "Theirs");
        assert_eq!(fetched.pending_operation, Some(PendingOperation::Update));
        assert_eq!(fetched.sync_state, SyncState::Conflict);
    }

    #[test]
    fn test_stores_share_one_database() {
        let db = Database::open_in_memory().unwrap();
        let farms: SqliteRecordStore<Farm> = SqliteRecordStore::open(&db).unwrap();
        let posts: SqliteRecordStore<crate::models::Post> = SqliteRecordStore::open(&db).unwrap();

        farms.upsert(&synced("f1", "Farm", 1)).unwrap();
        assert_eq!(farms.list_all(&RecordFilter::All).unwrap().len(), 1);
        assert!(posts.list_all(&RecordFilter::All).unwrap().is_empty());
    }
}
