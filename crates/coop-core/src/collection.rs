//! Read-through collection: what screens and view-models call.
//!
//! Reads are served from the local store immediately; writes land in the store
//! optimistically and are queued for the next cycle; refreshes go through the
//! collection's [`SyncGate`] so overlapping triggers coalesce.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::db::{NewConflict, RecordFilter, RecordStore, StoreWrite};
use crate::error::{Error, Result};
use crate::models::{
    ConflictStrategy, PendingOperation, RecordId, SyncConflict, SyncEntity, SyncRecord, SyncState,
};
use crate::remote::RemoteClient;
use crate::sync::{SyncEngine, SyncGate, SyncSummary};
use crate::util::{unix_millis_after, unix_millis_now};

/// A visible record: id plus payload, sync metadata hidden
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry<T> {
    pub id: RecordId,
    pub payload: T,
}

impl<T> From<SyncRecord<T>> for Entry<T> {
    fn from(record: SyncRecord<T>) -> Self {
        Self {
            id: record.id,
            payload: record.payload,
        }
    }
}

/// A local mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Create(T),
    Update { id: RecordId, payload: T },
    Delete { id: RecordId },
}

/// User decision for a record parked in `Conflict`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Upload the local payload again against the latest server version
    KeepLocal,
    /// Drop local changes and adopt the last downloaded server payload
    DiscardLocal,
}

type Loader<T> = Arc<dyn Fn() -> Result<Vec<Entry<T>>> + Send + Sync>;

/// Live query over the local store.
///
/// Holds the latest result; [`Observation::next`] waits for the store to
/// change and re-runs the query.
pub struct Observation<T> {
    changes: watch::Receiver<u64>,
    load: Loader<T>,
    current: Vec<Entry<T>>,
}

impl<T> std::fmt::Debug for Observation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("entries", &self.current.len())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Observation<T> {
    /// Latest query result
    pub fn current(&self) -> &[Entry<T>] {
        &self.current
    }

    /// Wait for the next store change and return the refreshed result.
    ///
    /// Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<Entry<T>>>> {
        self.changes.changed().await.ok()?;
        let _ = self.changes.borrow_and_update();
        Some((self.load)().inspect(|entries| self.current.clone_from(entries)))
    }

    /// The current result followed by one item per store change
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Entry<T>>>> {
        let first = self.current.clone();
        futures::stream::unfold((self, Some(first)), |(mut observation, first)| async move {
            if let Some(first) = first {
                return Some((Ok(first), (observation, None)));
            }
            let item = observation.next().await?;
            Some((item, (observation, None)))
        })
    }
}

/// Offline-first collection of one entity type
pub struct SyncedCollection<T, S, R> {
    engine: Arc<SyncEngine<T, S, R>>,
    gate: SyncGate,
    cancel: Mutex<CancellationToken>,
    stale_after: Duration,
}

impl<T, S, R> std::fmt::Debug for SyncedCollection<T, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedCollection")
            .field("engine", &self.engine)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl<T, S, R> SyncedCollection<T, S, R>
where
    T: SyncEntity,
    S: RecordStore<T> + 'static,
    R: RemoteClient<T> + 'static,
{
    pub fn new(engine: SyncEngine<T, S, R>) -> Self {
        Self {
            engine: Arc::new(engine),
            gate: SyncGate::new(),
            cancel: Mutex::new(CancellationToken::new()),
            stale_after: SyncConfig::default().stale_after(),
        }
    }

    /// Build the engine and collection from a shared configuration
    pub fn with_config(store: S, remote: R, config: &SyncConfig) -> Self {
        Self::new(SyncEngine::new(store, remote).with_config(config))
            .with_stale_after(config.stale_after())
    }

    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn engine(&self) -> &SyncEngine<T, S, R> {
        &self.engine
    }

    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    /// Live query; records pending deletion are hidden
    pub fn observe(&self, filter: RecordFilter<T>) -> Result<Observation<T>> {
        let engine = Arc::clone(&self.engine);
        let load: Loader<T> = Arc::new(move || visible_entries(engine.store(), &filter));
        let mut changes = self.store().subscribe();
        let _ = changes.borrow_and_update();
        let current = load()?;
        Ok(Observation {
            changes,
            load,
            current,
        })
    }

    /// One-off query; records pending deletion are hidden
    pub fn snapshot(&self, filter: &RecordFilter<T>) -> Result<Vec<Entry<T>>> {
        visible_entries(self.store(), filter)
    }

    /// Visible payload of one record
    pub fn get(&self, id: &RecordId) -> Result<Option<T>> {
        Ok(self
            .store()
            .get(id)?
            .filter(|record| !record.is_locally_deleted())
            .map(|record| record.payload))
    }

    /// Full record including sync metadata, for status displays
    pub fn record(&self, id: &RecordId) -> Result<Option<SyncRecord<T>>> {
        self.store().get(id)
    }

    /// Apply a change locally; never waits on the network.
    ///
    /// Returns the id of the affected record (a fresh client id for creates).
    pub fn mutate(&self, change: Change<T>) -> Result<RecordId> {
        match change {
            Change::Create(payload) => {
                let id = T::generate_id();
                let record = SyncRecord::new_local(id.clone(), payload, unix_millis_now());
                self.store().upsert(&record)?;
                tracing::debug!("Created {} {} locally", T::COLLECTION, id);
                Ok(id)
            }
            Change::Update { id, payload } => {
                self.store().update_with(&id, |current| match current {
                    Some(mut record) if !record.is_locally_deleted() => {
                        let now = unix_millis_after(record.client_updated_at);
                        record.apply_local_edit(payload, now);
                        (StoreWrite::Upsert(record), Ok(()))
                    }
                    _ => (StoreWrite::Unchanged, Err(not_found::<T>(&id))),
                })??;
                tracing::debug!("Updated {} {} locally", T::COLLECTION, id);
                Ok(id)
            }
            Change::Delete { id } => {
                self.store().update_with(&id, |current| match current {
                    Some(record) if record.is_unacknowledged_create() => (StoreWrite::Delete, ()),
                    Some(mut record) if !record.is_locally_deleted() => {
                        let now = unix_millis_after(record.client_updated_at);
                        record.apply_local_delete(now);
                        (StoreWrite::Upsert(record), ())
                    }
                    _ => (StoreWrite::Unchanged, ()),
                })?;
                tracing::debug!("Deleted {} {} locally", T::COLLECTION, id);
                Ok(id)
            }
        }
    }

    /// Run a cycle if the last successful one is older than `max_age`, or
    /// always when `force` is set. Returns `None` when the data was fresh.
    pub async fn refresh_if_stale(
        &self,
        max_age: Duration,
        force: bool,
    ) -> Result<Option<SyncSummary>> {
        if !force && !self.is_stale(max_age)? {
            return Ok(None);
        }
        self.sync_now().await.map(Some)
    }

    /// [`Self::refresh_if_stale`] with the collection's configured age
    pub async fn refresh(&self) -> Result<Option<SyncSummary>> {
        self.refresh_if_stale(self.stale_after, false).await
    }

    /// Whether the last successful cycle is older than `max_age` (or never ran)
    pub fn is_stale(&self, max_age: Duration) -> Result<bool> {
        let Some(last_cycle_at) = self.store().last_cycle_at()? else {
            return Ok(true);
        };
        let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        Ok(unix_millis_now().saturating_sub(last_cycle_at) >= max_age)
    }

    /// Run a cycle now, or join the one already running
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let cancel = self.cancel.lock().clone();
        self.gate.run(|| self.engine.run_cycle(&cancel)).await
    }

    /// Stop the running cycle at the next record boundary
    pub fn cancel_sync(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
    }

    /// Resolve a record parked in `Conflict`
    pub fn resolve_conflict(&self, id: &RecordId, resolution: Resolution) -> Result<()> {
        let resolved = self.store().update_with(id, |current| {
            let Some(mut record) = current else {
                return (StoreWrite::Unchanged, Err(not_found::<T>(id)));
            };
            if record.sync_state != SyncState::Conflict {
                return (
                    StoreWrite::Unchanged,
                    Err(Error::InvalidInput(format!(
                        "{} {id} is not in conflict",
                        T::COLLECTION
                    ))),
                );
            }
            let local_updated_at = record.client_updated_at;
            let incoming_updated_at = record.server_updated_at;
            match resolution {
                Resolution::KeepLocal => {
                    let operation = match record.pending_operation() {
                        // The server copy was downloaded, so the create landed
                        Some(PendingOperation::Create) if record.server_updated_at.is_some() => {
                            PendingOperation::Update
                        }
                        Some(operation) => operation,
                        None => PendingOperation::Update,
                    };
                    record.client_updated_at = unix_millis_after(record.client_updated_at);
                    record.mark_pending(operation);
                    record.sync_attempts = 0;
                    record.last_attempt_at = None;
                }
                Resolution::DiscardLocal => {
                    let (Some(payload), Some(server_updated_at)) =
                        (record.server_payload.take(), record.server_updated_at)
                    else {
                        return (
                            StoreWrite::Unchanged,
                            Err(Error::InvalidInput(format!(
                                "server version of {} {id} not downloaded yet; sync first",
                                T::COLLECTION
                            ))),
                        );
                    };
                    record.payload = payload;
                    record.client_updated_at = server_updated_at;
                    record.mark_synced(server_updated_at);
                }
            }
            (
                StoreWrite::Upsert(record),
                Ok((local_updated_at, incoming_updated_at)),
            )
        })?;
        let (local_updated_at, incoming_updated_at) = resolved?;

        let strategy = match resolution {
            Resolution::KeepLocal => ConflictStrategy::KeepLocal,
            Resolution::DiscardLocal => ConflictStrategy::DiscardLocal,
        };
        self.store().record_conflict(&NewConflict {
            record_id: id.as_str(),
            local_updated_at,
            incoming_updated_at,
            strategy,
        })?;
        tracing::info!(
            "Resolved conflict on {} {} ({})",
            T::COLLECTION,
            id,
            strategy.as_str()
        );
        Ok(())
    }

    /// Records with local work not yet acknowledged by the server
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.store().list_pending_sync()?.len())
    }

    /// Conflict log, newest first
    pub fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.store().list_conflicts(limit)
    }
}

fn visible_entries<T, S>(store: &S, filter: &RecordFilter<T>) -> Result<Vec<Entry<T>>>
where
    T: SyncEntity,
    S: RecordStore<T>,
{
    Ok(store
        .list_all(filter)?
        .into_iter()
        .filter(|record| !record.is_locally_deleted())
        .map(Entry::from)
        .collect())
}

fn not_found<T: SyncEntity>(id: &RecordId) -> Error {
    Error::NotFound(format!("{} {id}", T::COLLECTION))
}
