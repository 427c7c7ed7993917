//! Sync record model and its per-record state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

use super::remote::RemoteRecord;

/// Identifier of a synced record.
///
/// Client-created records use a UUID v7 so they can be created offline; the
/// server is free to assign a different id when it acknowledges the create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new client-side id using UUID v7 (time-sortable)
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("record id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-record synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Consistent with the last known server version
    Synced,
    /// Created locally, never acknowledged by the server
    PendingCreate,
    /// Edited locally, edit not yet acknowledged
    PendingUpdate,
    /// Deleted locally, delete not yet acknowledged
    PendingDelete,
    /// Upload rejected as stale; waits for a user decision
    Conflict,
    /// Last upload failed with a non-conflict API error
    Error,
}

impl SyncState {
    /// Column value stored in the local table
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::PendingCreate => "PENDING_CREATE",
            Self::PendingUpdate => "PENDING_UPDATE",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Conflict => "CONFLICT",
            Self::Error => "ERROR",
        }
    }

    /// Whether the state is one of the `Pending*` states
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNCED" => Ok(Self::Synced),
            "PENDING_CREATE" => Ok(Self::PendingCreate),
            "PENDING_UPDATE" => Ok(Self::PendingUpdate),
            "PENDING_DELETE" => Ok(Self::PendingDelete),
            "CONFLICT" => Ok(Self::Conflict),
            "ERROR" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync state: {other}"))),
        }
    }
}

/// Class of local mutation still waiting for a server acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOperation {
    Create,
    Update,
    Delete,
}

impl PendingOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// The `Pending*` state that expresses this operation
    #[must_use]
    pub const fn pending_state(self) -> SyncState {
        match self {
            Self::Create => SyncState::PendingCreate,
            Self::Update => SyncState::PendingUpdate,
            Self::Delete => SyncState::PendingDelete,
        }
    }
}

impl FromStr for PendingOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!(
                "unknown pending operation: {other}"
            ))),
        }
    }
}

/// One locally cached entity instance plus its sync metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord<T> {
    /// Client- or server-assigned identifier
    pub id: RecordId,
    /// Domain fields
    pub payload: T,
    /// Last local mutation (Unix ms)
    pub client_updated_at: i64,
    /// Last known server version (Unix ms), `None` until first sync
    pub server_updated_at: Option<i64>,
    /// Current sync state
    pub sync_state: SyncState,
    /// Failed upload attempts since the last success
    pub sync_attempts: u32,
    /// Diagnostic from the most recent failed attempt
    pub last_error: Option<String>,
    /// Outstanding mutation class, kept while in `Error` or `Conflict`
    pub pending_operation: Option<PendingOperation>,
    /// Time of the most recent failed upload attempt (Unix ms)
    pub last_attempt_at: Option<i64>,
    /// Latest server payload seen while local work was outstanding
    pub server_payload: Option<T>,
}

impl<T> SyncRecord<T> {
    /// A record created locally, waiting for its first upload
    pub const fn new_local(id: RecordId, payload: T, now: i64) -> Self {
        Self {
            id,
            payload,
            client_updated_at: now,
            server_updated_at: None,
            sync_state: SyncState::PendingCreate,
            sync_attempts: 0,
            last_error: None,
            pending_operation: Some(PendingOperation::Create),
            last_attempt_at: None,
            server_payload: None,
        }
    }

    /// A record downloaded from the server that the client had never seen
    pub fn from_remote(remote: RemoteRecord<T>) -> Self {
        Self {
            id: remote.id,
            payload: remote.payload,
            client_updated_at: remote.updated_at,
            server_updated_at: Some(remote.updated_at),
            sync_state: SyncState::Synced,
            sync_attempts: 0,
            last_error: None,
            pending_operation: None,
            last_attempt_at: None,
            server_payload: None,
        }
    }

    /// The mutation class an upload of this record would carry
    pub const fn pending_operation(&self) -> Option<PendingOperation> {
        match self.sync_state {
            SyncState::PendingCreate => Some(PendingOperation::Create),
            SyncState::PendingUpdate => Some(PendingOperation::Update),
            SyncState::PendingDelete => Some(PendingOperation::Delete),
            SyncState::Synced => None,
            SyncState::Conflict | SyncState::Error => self.pending_operation,
        }
    }

    /// Whether local work exists that the server has not acknowledged
    pub const fn has_local_work(&self) -> bool {
        !matches!(self.sync_state, SyncState::Synced)
    }

    /// Whether the user has deleted this record locally
    pub fn is_locally_deleted(&self) -> bool {
        self.pending_operation() == Some(PendingOperation::Delete)
    }

    /// Whether the record was never acknowledged by the server
    pub fn is_unacknowledged_create(&self) -> bool {
        self.pending_operation() == Some(PendingOperation::Create)
    }

    /// Apply a local edit.
    ///
    /// Edits collapse into the existing pending operation: an unacknowledged
    /// create stays a create, everything else becomes an update. A record in
    /// `Conflict` keeps its state until the conflict is resolved explicitly.
    pub fn apply_local_edit(&mut self, payload: T, now: i64) {
        self.payload = payload;
        self.client_updated_at = now;
        if self.sync_state == SyncState::Conflict {
            return;
        }
        let operation = if self.is_unacknowledged_create() {
            PendingOperation::Create
        } else {
            PendingOperation::Update
        };
        self.mark_pending(operation);
        self.sync_attempts = 0;
        self.last_attempt_at = None;
    }

    /// Apply a local delete to an acknowledged record
    pub fn apply_local_delete(&mut self, now: i64) {
        self.client_updated_at = now;
        self.mark_pending(PendingOperation::Delete);
        self.sync_attempts = 0;
        self.last_attempt_at = None;
    }

    /// Enter the `Pending*` state for `operation`
    pub fn mark_pending(&mut self, operation: PendingOperation) {
        self.sync_state = operation.pending_state();
        self.pending_operation = Some(operation);
        self.last_error = None;
    }

    /// The server acknowledged the outstanding mutation at `server_updated_at`
    pub fn mark_synced(&mut self, server_updated_at: i64) {
        self.server_updated_at = Some(server_updated_at);
        self.sync_state = SyncState::Synced;
        self.sync_attempts = 0;
        self.last_error = None;
        self.pending_operation = None;
        self.last_attempt_at = None;
        self.server_payload = None;
    }

    /// A non-conflict upload failure; the pending operation is retained
    pub fn mark_failed(&mut self, message: impl Into<String>, now: i64) {
        self.pending_operation = self.pending_operation();
        self.sync_state = SyncState::Error;
        self.sync_attempts = self.sync_attempts.saturating_add(1);
        self.last_error = Some(message.into());
        self.last_attempt_at = Some(now);
    }

    /// The server rejected the upload as stale
    pub fn mark_conflict(&mut self, message: impl Into<String>) {
        self.pending_operation = self.pending_operation();
        self.sync_state = SyncState::Conflict;
        self.last_error = Some(message.into());
    }

    /// Check the record-level invariants
    pub const fn is_consistent(&self) -> bool {
        match self.sync_state {
            SyncState::Synced => {
                self.server_updated_at.is_some()
                    && self.last_error.is_none()
                    && self.pending_operation.is_none()
            }
            SyncState::PendingCreate => self.server_updated_at.is_none(),
            SyncState::Conflict | SyncState::Error => self.pending_operation.is_some(),
            SyncState::PendingUpdate | SyncState::PendingDelete => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(payload: &str) -> SyncRecord<String> {
        SyncRecord::from_remote(RemoteRecord {
            id: RecordId::from("farm-1"),
            payload: payload.to_string(),
            updated_at: 1_000,
        })
    }

    #[test]
    fn test_record_id_unique() {
        assert_ne!(RecordId::generate(), RecordId::generate());
    }

    #[test]
    fn test_record_id_parse_rejects_blank() {
        assert!("  ".parse::<RecordId>().is_err());
        let parsed: RecordId = " abc ".parse().unwrap();
        assert_eq!(parsed.as_str(), "abc");
    }

    #[test]
    fn test_sync_state_roundtrip() {
        for state in [
            SyncState::Synced,
            SyncState::PendingCreate,
            SyncState::PendingUpdate,
            SyncState::PendingDelete,
            SyncState::Conflict,
            SyncState::Error,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("WAT".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_new_local_is_pending_create() {
        let record = SyncRecord::new_local(RecordId::from("x"), "hello", 5);
        assert_eq!(record.sync_state, SyncState::PendingCreate);
        assert_eq!(record.pending_operation(), Some(PendingOperation::Create));
        assert!(record.is_consistent());
    }

    #[test]
    fn test_edit_of_pending_create_stays_create() {
        let mut record = SyncRecord::new_local(RecordId::from("x"), "v1", 5);
        record.apply_local_edit("v2", 6);
        assert_eq!(record.sync_state, SyncState::PendingCreate);
        assert_eq!(record.payload, "v2");
        assert_eq!(record.client_updated_at, 6);
    }

    #[test]
    fn test_edit_of_synced_becomes_update() {
        let mut record = synced("v1");
        record.apply_local_edit("v2".to_string(), 2_000);
        assert_eq!(record.sync_state, SyncState::PendingUpdate);
        assert_eq!(record.server_updated_at, Some(1_000));
    }

    #[test]
    fn test_failed_create_keeps_operation() {
        let mut record = SyncRecord::new_local(RecordId::from("x"), "v1", 5);
        record.mark_failed("bad request", 10);
        assert_eq!(record.sync_state, SyncState::Error);
        assert_eq!(record.sync_attempts, 1);
        assert_eq!(record.pending_operation(), Some(PendingOperation::Create));
        assert!(record.is_unacknowledged_create());

        record.apply_local_edit("v2", 11);
        assert_eq!(record.sync_state, SyncState::PendingCreate);
        assert_eq!(record.sync_attempts, 0);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_conflict_survives_local_edit() {
        let mut record = synced("v1");
        record.apply_local_edit("v2".to_string(), 2_000);
        record.mark_conflict("stale version");
        record.apply_local_edit("v3".to_string(), 2_001);
        assert_eq!(record.sync_state, SyncState::Conflict);
        assert_eq!(record.payload, "v3");
        assert_eq!(record.pending_operation(), Some(PendingOperation::Update));
    }

    #[test]
    fn test_mark_synced_clears_metadata() {
        let mut record = synced("v1");
        record.apply_local_edit("v2".to_string(), 2_000);
        record.mark_failed("boom", 2_001);
        record.mark_synced(3_000);
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.server_updated_at, Some(3_000));
        assert_eq!(record.sync_attempts, 0);
        assert!(record.is_consistent());
    }
}
