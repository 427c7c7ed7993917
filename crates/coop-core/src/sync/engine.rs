//! Reconciliation cycle for one collection.
//!
//! A cycle always uploads every locally pending record first and then
//! downloads the server's records, merging them through [`resolve`]. Remote
//! calls are the only await points; each record's transition is written
//! atomically through [`RecordStore::update_with`], so a cycle interrupted at
//! any point can simply be run again.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::db::{NewConflict, RecordFilter, RecordStore, StoreWrite};
use crate::error::Result;
use crate::models::{
    ConflictStrategy, PendingOperation, RecordId, RemoteRecord, SyncEntity, SyncRecord, SyncState,
};
use crate::remote::{ApiError, RemoteClient, RemoteError};
use crate::util::unix_millis_now;

use super::policy::{resolve, Decision};
use super::retry::{RetryPolicy, RetryVerdict};

const STALE_VERSION: &str = "stale version";
const UNCONFIRMED_CREATE: &str = "create may have reached the server; response was unreadable";

/// Category of a per-record (or per-phase) failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// Server unreachable; record state left untouched and the cycle stopped
    Transport,
    /// One request got no answer in time; record state left untouched
    Timeout,
    /// The server answered with a non-conflict error
    Api { status: u16, code: String },
    /// Payload failed validation before upload
    Invalid,
    /// Success status with a body that could not be decoded
    InvalidResponse,
}

/// One failure reported by a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    /// Affected record; `None` for download failures
    pub record_id: Option<RecordId>,
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    fn from_remote(record_id: Option<RecordId>, error: &RemoteError) -> Self {
        match error {
            RemoteError::Transport(message) => Self {
                record_id,
                kind: FailureKind::Transport,
                message: message.clone(),
            },
            RemoteError::Timeout(message) => Self {
                record_id,
                kind: FailureKind::Timeout,
                message: message.clone(),
            },
            RemoteError::Api(error) => Self::api(record_id, error),
            RemoteError::InvalidResponse(message) => Self {
                record_id,
                kind: FailureKind::InvalidResponse,
                message: message.clone(),
            },
        }
    }

    fn api(record_id: Option<RecordId>, error: &ApiError) -> Self {
        Self {
            record_id,
            kind: FailureKind::Api {
                status: error.status,
                code: error.code.clone(),
            },
            message: error.message.clone(),
        }
    }

    /// No answer from the server (unreachable or timed out)
    pub const fn is_transport(&self) -> bool {
        matches!(self.kind, FailureKind::Transport | FailureKind::Timeout)
    }
}

/// Aggregate result of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Creates acknowledged by the server
    pub created: usize,
    pub updated_upstream: usize,
    pub deleted_upstream: usize,
    /// Server records inserted locally for the first time
    pub downloaded_new: usize,
    /// Local `Synced` records replaced by a newer server version
    pub updated_from_server: usize,
    /// Local `Synced` records removed because a full download no longer had them
    pub deleted_from_server: usize,
    /// Download conflicts plus uploads rejected as stale
    pub conflicts: usize,
    /// Records held back by the retry policy
    pub skipped: usize,
    pub errors: Vec<SyncFailure>,
    /// The cycle stopped early on cancellation
    pub cancelled: bool,
}

impl SyncSummary {
    /// No failures and no new conflicts
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.conflicts == 0 && !self.cancelled
    }

    pub const fn uploaded(&self) -> usize {
        self.created + self.updated_upstream + self.deleted_upstream
    }

    pub const fn downloaded(&self) -> usize {
        self.downloaded_new + self.updated_from_server + self.deleted_from_server
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}/{}/{} (create/update/delete), down {}/{}/{} (new/updated/removed), \
             {} conflicts, {} skipped, {} errors",
            self.created,
            self.updated_upstream,
            self.deleted_upstream,
            self.downloaded_new,
            self.updated_from_server,
            self.deleted_from_server,
            self.conflicts,
            self.skipped,
            self.errors.len()
        )?;
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The server is unreachable; nothing else in this cycle can succeed
    Offline,
}

enum Ack<T> {
    Created(RemoteRecord<T>),
    Updated(RemoteRecord<T>),
    Deleted,
}

enum Merge {
    Inserted,
    Adopted,
    Kept,
    /// Snapshot refreshed on a record already parked in `Conflict`
    Refreshed,
    Conflicted {
        local_updated_at: i64,
        incoming_updated_at: i64,
    },
}

/// Orchestrates one collection's store and remote
pub struct SyncEngine<T, S, R> {
    store: S,
    remote: R,
    retry: RetryPolicy,
    incremental_fetch: bool,
    full_snapshot_deletes: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T, S, R> fmt::Debug for SyncEngine<T, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("retry", &self.retry)
            .field("incremental_fetch", &self.incremental_fetch)
            .field("full_snapshot_deletes", &self.full_snapshot_deletes)
            .finish_non_exhaustive()
    }
}

impl<T, S, R> SyncEngine<T, S, R>
where
    T: SyncEntity,
    S: RecordStore<T>,
    R: RemoteClient<T>,
{
    /// Engine with the default retry policy, full downloads and no deletion inference
    pub fn new(store: S, remote: R) -> Self {
        Self {
            store,
            remote,
            retry: RetryPolicy::default(),
            incremental_fetch: false,
            full_snapshot_deletes: false,
            _payload: PhantomData,
        }
    }

    /// Apply the retry and download settings from `config`
    #[must_use]
    pub const fn with_config(mut self, config: &SyncConfig) -> Self {
        self.retry = config.retry_policy();
        self.incremental_fetch = config.incremental_fetch;
        self.full_snapshot_deletes = config.full_snapshot_deletes;
        self
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Download only changes since the stored cursor when the remote supports it
    #[must_use]
    pub const fn with_incremental_fetch(mut self, enabled: bool) -> Self {
        self.incremental_fetch = enabled;
        self
    }

    /// Treat a full download as a complete snapshot and drop `Synced` records it lacks
    #[must_use]
    pub const fn with_full_snapshot_deletes(mut self, enabled: bool) -> Self {
        self.full_snapshot_deletes = enabled;
        self
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one reconciliation cycle.
    ///
    /// Returns `Err` only when the local store fails; remote failures are
    /// recorded on the affected records and in the summary. The finish time is
    /// persisted as the last successful cycle only when the download phase
    /// completed.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let pending = self.store.list_pending_sync()?;
        tracing::debug!(
            "Starting {} sync cycle with {} pending records",
            T::COLLECTION,
            pending.len()
        );

        let mut flow = Flow::Continue;
        for record in pending {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            flow = self.upload(record, &mut summary).await?;
            if flow == Flow::Offline {
                break;
            }
        }

        if flow == Flow::Continue && !summary.cancelled {
            if cancel.is_cancelled() {
                summary.cancelled = true;
            } else if self.download(cancel, &mut summary).await? {
                self.store.set_last_cycle_at(unix_millis_now())?;
            }
        }

        if summary.cancelled {
            tracing::info!("Sync of {} cancelled: {}", T::COLLECTION, summary);
        } else if summary.errors.is_empty() {
            tracing::info!("Synced {}: {}", T::COLLECTION, summary);
        } else {
            tracing::warn!("Synced {} with failures: {}", T::COLLECTION, summary);
        }
        Ok(summary)
    }

    async fn upload(&self, record: SyncRecord<T>, summary: &mut SyncSummary) -> Result<Flow> {
        if record.sync_state == SyncState::Conflict {
            return Ok(Flow::Continue);
        }
        let Some(operation) = record.pending_operation() else {
            tracing::warn!(
                "Record {} in {} has no pending operation; not uploading",
                record.id,
                T::COLLECTION
            );
            return Ok(Flow::Continue);
        };

        let now = unix_millis_now();
        match self.retry.verdict(&record, now) {
            RetryVerdict::Attempt => {}
            RetryVerdict::GaveUp => {
                tracing::debug!(
                    "Skipping {} {} after {} failed attempts",
                    T::COLLECTION,
                    record.id,
                    record.sync_attempts
                );
                summary.skipped += 1;
                return Ok(Flow::Continue);
            }
            RetryVerdict::Backoff { retry_at } => {
                tracing::debug!(
                    "Skipping {} {} until {}",
                    T::COLLECTION,
                    record.id,
                    retry_at
                );
                summary.skipped += 1;
                return Ok(Flow::Continue);
            }
        }

        if operation != PendingOperation::Delete {
            if let Err(error) = record.payload.validate() {
                let message = error.to_string();
                tracing::warn!("Not uploading invalid {} {}: {}", T::COLLECTION, record.id, message);
                self.record_failure(&record, &message, now)?;
                summary.errors.push(SyncFailure {
                    record_id: Some(record.id.clone()),
                    kind: FailureKind::Invalid,
                    message,
                });
                return Ok(Flow::Continue);
            }
        }

        let response = match operation {
            PendingOperation::Create => self
                .remote
                .create(&record.id, &record.payload)
                .await
                .map(Ack::Created),
            PendingOperation::Update => self
                .remote
                .update(&record.id, &record.payload, record.server_updated_at)
                .await
                .map(Ack::Updated),
            PendingOperation::Delete => match self.remote.delete(&record.id).await {
                Ok(()) => Ok(Ack::Deleted),
                Err(RemoteError::Api(error)) if error.is_not_found() => {
                    tracing::debug!(
                        "{} {} already gone on the server; treating delete as done",
                        T::COLLECTION,
                        record.id
                    );
                    Ok(Ack::Deleted)
                }
                Err(error) => Err(error),
            },
        };

        match response {
            Ok(ack) => {
                self.apply_ack(&record, ack, summary)?;
                Ok(Flow::Continue)
            }
            Err(RemoteError::Transport(message)) => {
                tracing::warn!(
                    "Server unreachable uploading {} {}: {}",
                    T::COLLECTION,
                    record.id,
                    message
                );
                summary.errors.push(SyncFailure {
                    record_id: Some(record.id),
                    kind: FailureKind::Transport,
                    message,
                });
                Ok(Flow::Offline)
            }
            Err(error @ RemoteError::Timeout(_)) => {
                tracing::warn!("Upload of {} {} timed out: {}", T::COLLECTION, record.id, error);
                summary
                    .errors
                    .push(SyncFailure::from_remote(Some(record.id), &error));
                Ok(Flow::Continue)
            }
            Err(RemoteError::Api(error))
                if operation == PendingOperation::Update && error.is_precondition_failed() =>
            {
                self.park_conflict(&record, STALE_VERSION, ConflictStrategy::StaleVersion, summary)?;
                Ok(Flow::Continue)
            }
            Err(error @ RemoteError::InvalidResponse(_)) if operation == PendingOperation::Create => {
                // Retrying the create could duplicate the record on the server
                tracing::warn!(
                    "Create of {} {} answered with an unreadable body: {}",
                    T::COLLECTION,
                    record.id,
                    error
                );
                self.park_conflict(
                    &record,
                    UNCONFIRMED_CREATE,
                    ConflictStrategy::UnconfirmedCreate,
                    summary,
                )?;
                summary
                    .errors
                    .push(SyncFailure::from_remote(Some(record.id), &error));
                Ok(Flow::Continue)
            }
            Err(error) => {
                tracing::warn!(
                    "Upload of {} {} failed: {}",
                    T::COLLECTION,
                    record.id,
                    error
                );
                self.record_failure(&record, &failure_message(&error), now)?;
                summary
                    .errors
                    .push(SyncFailure::from_remote(Some(record.id.clone()), &error));
                Ok(Flow::Continue)
            }
        }
    }

    /// Record a server acknowledgment for `sent`, keeping any edit made while
    /// the call was in flight
    fn apply_ack(&self, sent: &SyncRecord<T>, ack: Ack<T>, summary: &mut SyncSummary) -> Result<()> {
        let sent_at = sent.client_updated_at;
        match ack {
            Ack::Created(remote) => {
                let server_id = remote.id.clone();
                self.store.update_with(&sent.id, move |current| {
                    let Some(mut current) = current else {
                        // Deleted locally while the create was in flight
                        let mut orphan = SyncRecord::from_remote(remote);
                        orphan.apply_local_delete(unix_millis_now());
                        return (StoreWrite::Upsert(orphan), ());
                    };
                    let rekey = current.id != remote.id;
                    current.id = remote.id;
                    if current.client_updated_at == sent_at {
                        current.payload = remote.payload;
                        current.mark_synced(remote.updated_at);
                    } else {
                        current.server_updated_at = Some(remote.updated_at);
                        current.mark_pending(PendingOperation::Update);
                    }
                    let write = if rekey {
                        StoreWrite::Rekey(current)
                    } else {
                        StoreWrite::Upsert(current)
                    };
                    (write, ())
                })?;
                if server_id == sent.id {
                    tracing::debug!("Created {} {}", T::COLLECTION, server_id);
                } else {
                    tracing::debug!("Created {} {} as {}", T::COLLECTION, sent.id, server_id);
                }
                summary.created += 1;
            }
            Ack::Updated(remote) => {
                self.store.update_with(&sent.id, move |current| {
                    let Some(mut current) = current else {
                        return (StoreWrite::Unchanged, ());
                    };
                    if current.client_updated_at == sent_at {
                        current.payload = remote.payload;
                        current.mark_synced(remote.updated_at);
                    } else {
                        current.server_updated_at = Some(remote.updated_at);
                    }
                    (StoreWrite::Upsert(current), ())
                })?;
                tracing::debug!("Updated {} {}", T::COLLECTION, sent.id);
                summary.updated_upstream += 1;
            }
            Ack::Deleted => {
                self.store.update_with(&sent.id, |current| match current {
                    Some(current) if current.is_locally_deleted() => (StoreWrite::Delete, ()),
                    _ => (StoreWrite::Unchanged, ()),
                })?;
                tracing::debug!("Deleted {} {}", T::COLLECTION, sent.id);
                summary.deleted_upstream += 1;
            }
        }
        Ok(())
    }

    /// Mark `sent` as failed unless it was edited while the call was in flight
    fn record_failure(&self, sent: &SyncRecord<T>, message: &str, now: i64) -> Result<()> {
        let sent_at = sent.client_updated_at;
        self.store.update_with(&sent.id, |current| match current {
            Some(mut current) if current.client_updated_at == sent_at => {
                current.mark_failed(message, now);
                (StoreWrite::Upsert(current), ())
            }
            _ => (StoreWrite::Unchanged, ()),
        })
    }

    /// Park `sent` in `Conflict` with its local payload intact, to wait for
    /// a user decision
    fn park_conflict(
        &self,
        sent: &SyncRecord<T>,
        reason: &str,
        strategy: ConflictStrategy,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let parked = self.store.update_with(&sent.id, |current| match current {
            Some(mut current)
                if current.has_local_work()
                    && current.sync_state != SyncState::Conflict
                    && !current.is_locally_deleted() =>
            {
                current.mark_conflict(reason);
                let local_updated_at = current.client_updated_at;
                (StoreWrite::Upsert(current), Some(local_updated_at))
            }
            _ => (StoreWrite::Unchanged, None),
        })?;

        if let Some(local_updated_at) = parked {
            tracing::warn!(
                "{} {} parked in conflict ({}); waiting for resolution",
                T::COLLECTION,
                sent.id,
                strategy.as_str()
            );
            self.store.record_conflict(&NewConflict {
                record_id: sent.id.as_str(),
                local_updated_at,
                incoming_updated_at: None,
                strategy,
            })?;
            summary.conflicts += 1;
        }
        Ok(())
    }

    /// Download and merge; returns whether the phase ran to completion
    async fn download(&self, cancel: &CancellationToken, summary: &mut SyncSummary) -> Result<bool> {
        let delta = self.incremental_fetch && self.remote.supports_delta();
        let since = if delta { self.store.cursor()? } else { None };

        let incoming = match self.remote.list(since).await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!("Download of {} failed: {}", T::COLLECTION, error);
                summary.errors.push(SyncFailure::from_remote(None, &error));
                return Ok(false);
            }
        };
        tracing::debug!(
            "Downloaded {} {} records (since {:?})",
            incoming.len(),
            T::COLLECTION,
            since
        );

        let mut seen = HashSet::with_capacity(incoming.len());
        let mut newest = None;
        for remote in incoming {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(false);
            }
            newest = newest.max(Some(remote.updated_at));
            seen.insert(remote.id.clone());
            self.merge(remote, summary)?;
        }

        if let Some(cursor) = newest {
            self.store.advance_cursor(cursor)?;
        }
        if !delta && self.full_snapshot_deletes {
            self.remove_missing(&seen, summary)?;
        }
        Ok(true)
    }

    fn merge(&self, remote: RemoteRecord<T>, summary: &mut SyncSummary) -> Result<()> {
        let id = remote.id.clone();
        let outcome = self.store.update_with(&id, move |current| {
            let Some(mut local) = current else {
                return (
                    StoreWrite::Upsert(SyncRecord::from_remote(remote)),
                    Merge::Inserted,
                );
            };
            match resolve(&local, &remote) {
                Decision::Unchanged | Decision::KeepLocalRetryUpload => {
                    (StoreWrite::Unchanged, Merge::Kept)
                }
                Decision::AdoptRemote => {
                    local.payload = remote.payload;
                    local.client_updated_at = remote.updated_at;
                    local.mark_synced(remote.updated_at);
                    (StoreWrite::Upsert(local), Merge::Adopted)
                }
                Decision::Conflict if local.sync_state == SyncState::Conflict => {
                    if local
                        .server_updated_at
                        .is_some_and(|known| remote.updated_at < known)
                    {
                        return (StoreWrite::Unchanged, Merge::Kept);
                    }
                    local.server_payload = Some(remote.payload);
                    local.server_updated_at = Some(remote.updated_at);
                    (StoreWrite::Upsert(local), Merge::Refreshed)
                }
                Decision::Conflict => {
                    // The server now knows the id, so an unacknowledged create
                    // continues as an update against the server's version
                    let operation = match local.pending_operation() {
                        Some(PendingOperation::Delete) => PendingOperation::Delete,
                        _ => PendingOperation::Update,
                    };
                    let local_updated_at = local.client_updated_at;
                    local.server_payload = Some(remote.payload);
                    local.server_updated_at = Some(remote.updated_at);
                    if local.sync_state == SyncState::Error {
                        // Still failing: the retry policy keeps deciding when it goes up
                        local.pending_operation = Some(operation);
                    } else {
                        local.mark_pending(operation);
                    }
                    (
                        StoreWrite::Upsert(local),
                        Merge::Conflicted {
                            local_updated_at,
                            incoming_updated_at: remote.updated_at,
                        },
                    )
                }
            }
        })?;

        match outcome {
            Merge::Inserted => summary.downloaded_new += 1,
            Merge::Adopted => summary.updated_from_server += 1,
            Merge::Kept | Merge::Refreshed => {}
            Merge::Conflicted {
                local_updated_at,
                incoming_updated_at,
            } => {
                tracing::info!(
                    "{} {} changed on the server while local changes were pending; keeping local changes",
                    T::COLLECTION,
                    id
                );
                self.store.record_conflict(&NewConflict {
                    record_id: id.as_str(),
                    local_updated_at,
                    incoming_updated_at: Some(incoming_updated_at),
                    strategy: ConflictStrategy::RetainLocal,
                })?;
                summary.conflicts += 1;
            }
        }
        Ok(())
    }

    fn remove_missing(&self, seen: &HashSet<RecordId>, summary: &mut SyncSummary) -> Result<()> {
        let synced = self
            .store
            .list_all(&RecordFilter::State(SyncState::Synced))?;
        for record in synced.into_iter().filter(|record| !seen.contains(&record.id)) {
            let removed = self.store.update_with(&record.id, |current| match current {
                Some(current) if current.sync_state == SyncState::Synced => {
                    (StoreWrite::Delete, true)
                }
                _ => (StoreWrite::Unchanged, false),
            })?;
            if removed {
                tracing::debug!("Removed {} {} missing from the server", T::COLLECTION, record.id);
                summary.deleted_from_server += 1;
            }
        }
        Ok(())
    }
}

/// Message stored on a record whose upload failed
fn failure_message(error: &RemoteError) -> String {
    match error {
        RemoteError::Api(error) => error.to_string(),
        other => other.to_string(),
    }
}
