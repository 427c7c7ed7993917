//! coop-core - offline-first record synchronization
//!
//! Farms, posts, comments and profiles are cached in a local `SQLite` store
//! and edited optimistically. A per-collection sync engine uploads pending
//! local changes and then downloads the server's records, merging them
//! without losing unsynced local work.
//!
//! ```no_run
//! use coop_core::collection::{Change, SyncedCollection};
//! use coop_core::config::SyncConfig;
//! use coop_core::db::{Database, RecordFilter, SqliteRecordStore};
//! use coop_core::models::Farm;
//! use coop_core::remote::HttpRemoteClient;
//!
//! # async fn demo() -> coop_core::Result<()> {
//! let config = coop_core::config::parse_sync_config(
//!     r#"{ "api_base_url": "https://api.example.com/v1" }"#,
//! )?;
//! let db = Database::open("coop.db")?;
//! let farms = SyncedCollection::with_config(
//!     SqliteRecordStore::<Farm>::open(&db)?,
//!     HttpRemoteClient::<Farm>::from_config(&config)?,
//!     &config,
//! );
//!
//! farms.mutate(Change::Create(Farm::new("user-1", "Green Acres")))?;
//! let visible = farms.snapshot(&RecordFilter::All)?;
//! assert_eq!(visible.len(), 1);
//! farms.refresh().await?;
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod sync;
pub mod util;

pub use collection::{Change, Entry, Observation, Resolution, SyncedCollection};
pub use coordinator::{CollectionReport, SyncCoordinator, SyncTarget};
pub use error::{Error, Result};
pub use models::{RecordId, SyncEntity, SyncRecord, SyncState};
pub use sync::{SyncEngine, SyncSummary};
