//! Local store for coop

mod connection;
mod migrations;
mod record_store;
mod sync_meta_repository;

pub use connection::Database;
pub use record_store::{RecordFilter, RecordStore, SqliteRecordStore, StoreWrite};
pub use sync_meta_repository::{NewConflict, SqliteSyncMetaRepository};
