//! Sync conflict model

use serde::{Deserialize, Serialize};

/// How a logged conflict was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Download found a newer server version; local payload kept for re-upload
    RetainLocal,
    /// Upload rejected with a precondition failure; record parked in `Conflict`
    StaleVersion,
    /// Create answered with an unreadable body; whether it landed is unknown
    UnconfirmedCreate,
    /// User kept the local payload
    KeepLocal,
    /// User discarded the local payload in favor of the server version
    DiscardLocal,
}

impl ConflictStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetainLocal => "retain_local",
            Self::StaleVersion => "stale_version",
            Self::UnconfirmedCreate => "unconfirmed_create",
            Self::KeepLocal => "keep_local",
            Self::DiscardLocal => "discard_local",
        }
    }
}

/// Recorded sync conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Collection (entity type) the record belongs to
    pub collection: String,
    /// Record involved in the conflict
    pub record_id: String,
    /// Local record's timestamp when the conflict occurred
    pub local_updated_at: i64,
    /// Incoming server timestamp, when known
    pub incoming_updated_at: Option<i64>,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
