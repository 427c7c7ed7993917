//! Data models for coop

mod comment;
mod entity;
mod farm;
mod post;
mod profile;
mod record;
mod remote;
mod sync_conflict;

pub use comment::Comment;
pub use entity::SyncEntity;
pub(crate) use entity::is_valid_collection_name;
pub use farm::Farm;
pub use post::Post;
pub use profile::Profile;
pub use record::{PendingOperation, RecordId, SyncRecord, SyncState};
pub use remote::RemoteRecord;
pub use sync_conflict::{ConflictStrategy, SyncConflict};
