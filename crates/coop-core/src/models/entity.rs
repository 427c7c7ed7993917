//! Per-entity adapter trait

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

use super::record::RecordId;

/// A domain payload that can be cached locally and synced with the server.
///
/// Implementors provide the small per-entity pieces the generic engine needs:
/// the collection name (local table and remote path), validation before upload,
/// the text used by substring search, and id generation.
pub trait SyncEntity:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection name; also the local table name, so `[a-z0-9_]` only
    const COLLECTION: &'static str;

    /// Reject payloads the server is known to refuse
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Text searched by `RecordFilter::Search`
    fn search_text(&self) -> String;

    /// Generate a client-side id for an offline create
    fn generate_id() -> RecordId {
        RecordId::generate()
    }
}

/// Returns true when `name` is safe to use as a table name.
pub(crate) fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_restricted() {
        assert!(is_valid_collection_name("farms"));
        assert!(is_valid_collection_name("user_profiles"));
        assert!(!is_valid_collection_name(""));
        assert!(!is_valid_collection_name("1farms"));
        assert!(!is_valid_collection_name("farms; DROP TABLE x"));
        assert!(!is_valid_collection_name("Farms"));
    }
}
