//! Server-side view of a record

use serde::{Deserialize, Serialize};

use super::record::RecordId;

/// A record as returned by the remote API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord<T> {
    /// Server-side identifier
    pub id: RecordId,
    /// Domain fields
    pub payload: T,
    /// Authoritative version time (Unix ms)
    pub updated_at: i64,
}
