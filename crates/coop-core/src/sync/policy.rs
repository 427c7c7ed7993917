//! Conflict policy: how a downloaded record meets its local copy

use crate::models::{RemoteRecord, SyncRecord, SyncState};

/// What the download phase should do with one incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Replace the local copy with the server version
    AdoptRemote,
    /// The server has not moved since the local edit was made; upload stays queued
    KeepLocalRetryUpload,
    /// Both sides changed since the last known common version
    Conflict,
    /// Nothing newer on the server
    Unchanged,
}

/// Decide how `remote` is merged into `local`. Pure; no I/O.
///
/// A local record with no known server version (an unacknowledged create)
/// treats any server copy as newer.
pub fn resolve<T>(local: &SyncRecord<T>, remote: &RemoteRecord<T>) -> Decision {
    let newer = local
        .server_updated_at
        .is_none_or(|known| remote.updated_at > known);

    match local.sync_state {
        SyncState::Synced if newer => Decision::AdoptRemote,
        SyncState::Synced => Decision::Unchanged,
        SyncState::Conflict => Decision::Conflict,
        SyncState::PendingCreate
        | SyncState::PendingUpdate
        | SyncState::PendingDelete
        | SyncState::Error => {
            if newer {
                Decision::Conflict
            } else {
                Decision::KeepLocalRetryUpload
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordId;

    fn remote(at: i64) -> RemoteRecord<&'static str> {
        RemoteRecord {
            id: RecordId::from("r1"),
            payload: "server",
            updated_at: at,
        }
    }

    fn synced_at(at: i64) -> SyncRecord<&'static str> {
        SyncRecord::from_remote(remote(at))
    }

    #[test]
    fn synced_adopts_only_newer_versions() {
        let local = synced_at(100);
        assert_eq!(resolve(&local, &remote(101)), Decision::AdoptRemote);
        assert_eq!(resolve(&local, &remote(100)), Decision::Unchanged);
        assert_eq!(resolve(&local, &remote(99)), Decision::Unchanged);
    }

    #[test]
    fn pending_with_unchanged_server_keeps_local() {
        let mut local = synced_at(100);
        local.apply_local_edit("mine", 150);
        assert_eq!(resolve(&local, &remote(100)), Decision::KeepLocalRetryUpload);

        local.apply_local_delete(160);
        assert_eq!(resolve(&local, &remote(90)), Decision::KeepLocalRetryUpload);
    }

    #[test]
    fn pending_with_newer_server_conflicts() {
        let mut local = synced_at(100);
        local.apply_local_edit("mine", 150);
        assert_eq!(resolve(&local, &remote(200)), Decision::Conflict);

        local.mark_failed("HTTP 500", 151);
        assert_eq!(resolve(&local, &remote(200)), Decision::Conflict);
    }

    #[test]
    fn unacknowledged_create_conflicts_with_any_server_copy() {
        let local = SyncRecord::new_local(RecordId::from("r1"), "mine", 50);
        assert_eq!(resolve(&local, &remote(1)), Decision::Conflict);
    }

    #[test]
    fn conflict_state_stays_conflict() {
        let mut local = synced_at(100);
        local.apply_local_edit("mine", 150);
        local.mark_conflict("stale version");
        assert_eq!(resolve(&local, &remote(100)), Decision::Conflict);
        assert_eq!(resolve(&local, &remote(300)), Decision::Conflict);
    }
}
